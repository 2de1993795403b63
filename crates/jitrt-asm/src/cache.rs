//! The executable code cache plus the link/repatch machinery that places
//! and later mutates code inside it.
//!
//! `LinkBuffer` resolves a [`CompiledCode`]'s relocations against a
//! [`SymbolResolver`] and produces the placed [`ExecutableCode`].
//! `RepatchBuffer` rewrites an already-linked region in place — a jump
//! target, a shape immediate, a storeback displacement — as inline caches
//! learn new shapes and guards get linked into trees. `CodeCache` is the
//! thread-safe table both JIT tiers register their output in, keyed by a
//! small integer handle the caller mints (a fragment id or a script id).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::backend::{
    CodegenBackend, CodegenError, CompiledCode, ExecutableCode, RuntimeHelper, SymbolResolver, TargetArch, TargetInfo,
};
use crate::ir::AsmFunction;

/// Opaque handle minted by [`CodeCache::alloc_id`] and used to key entries.
/// Both TraceJIT fragments and MethodJIT scripts share this cache; the
/// caller picks whichever namespace it owns (fragment index, script id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheId(pub u64);

/// Resolves relocations against already-placed code and copies the patched
/// bytes into their final home. Real engines copy into freshly-mapped
/// executable pages; this workspace models the placed region as an owned
/// `Vec<u8>` (see [`ExecutableCode`]'s doc comment) and "toggling W^X" as a
/// no-op, since nothing here ever actually executes the bytes.
pub struct LinkBuffer;

impl LinkBuffer {
    /// Apply every relocation in `code` by writing the resolved address as
    /// a little-endian `usize` at its `code_offset`, then package the
    /// result as placed, executable code. Fails if any relocation's target
    /// cannot be resolved.
    pub fn link(mut code: CompiledCode, resolver: &dyn SymbolResolver) -> Result<ExecutableCode, CodegenError> {
        for reloc in &code.relocations {
            let addr = resolve(resolver, reloc.target).ok_or(CodegenError::UnresolvedRelocation(reloc.target))?;
            write_usize(&mut code.code, reloc.code_offset, addr);
        }
        Ok(ExecutableCode {
            code: code.code,
            entry_offset: code.entry_offset,
            stack_maps: code.stack_maps,
            deopt_info: code.deopt_info,
        })
    }
}

fn resolve(resolver: &dyn SymbolResolver, target: crate::backend::RelocationTarget) -> Option<usize> {
    use crate::backend::RelocationTarget::*;
    match target {
        RuntimeHelper(h) => resolver.resolve_runtime_helper(h),
        Fragment(id) => resolver.resolve_fragment(id),
        Absolute(addr) => Some(addr),
    }
}

fn write_usize(code: &mut [u8], offset: usize, value: usize) {
    let bytes = (value as u64).to_le_bytes();
    let end = offset + bytes.len();
    if end <= code.len() {
        code[offset..end].copy_from_slice(&bytes);
    }
}

/// A scoped, in-place rewrite of already-linked code.
///
/// Construction "toggles pages R/W"; `Drop` "re-protects" them executable.
/// Both are no-ops over the owned-`Vec<u8>` model, but kept as an explicit
/// phase so call sites read the same way the source's repatch sequences do:
/// acquire the buffer, make every edit, drop it.
pub struct RepatchBuffer<'a> {
    code: &'a mut [u8],
}

impl<'a> RepatchBuffer<'a> {
    /// Begin a repatch scope over `code`.
    pub fn new(code: &'a mut ExecutableCode) -> Self {
        RepatchBuffer { code: &mut code.code }
    }

    /// Overwrite the 4-byte immediate at `offset` (a jump displacement, a
    /// patched shape id's low bits, ...).
    pub fn repatch_immediate_i32(&mut self, offset: usize, value: i32) {
        let bytes = value.to_le_bytes();
        let end = offset + bytes.len();
        if end <= self.code.len() {
            self.code[offset..end].copy_from_slice(&bytes);
        }
    }

    /// Overwrite a full pointer-width slot at `offset` — used to retarget a
    /// guard's branch to a newly-linked child fragment, or an IC's jump to
    /// a freshly assembled stub.
    pub fn repatch_address(&mut self, offset: usize, addr: usize) {
        write_usize(self.code, offset, addr);
    }

    /// Read back the bytes at `offset..offset+len`, for tests that assert a
    /// patch took effect.
    pub fn peek(&self, offset: usize, len: usize) -> &[u8] {
        &self.code[offset..offset + len]
    }
}

struct CacheEntry {
    code: ExecutableCode,
    invalidated: AtomicBool,
}

/// Thread-safe table of placed, executable code.
///
/// Shared across a compartment: TraceJIT fragments and MethodJIT scripts
/// both register their output here under ids they mint themselves via
/// [`alloc_id`](CodeCache::alloc_id). Entries are never moved once
/// inserted — repatching happens through a [`RepatchBuffer`] borrowed from
/// the entry in place, not by reinserting.
pub struct CodeCache {
    entries: RwLock<FxHashMap<CacheId, CacheEntry>>,
    next_id: AtomicU64,
    total_code_size: AtomicUsize,
    max_size: usize,
}

impl CodeCache {
    /// Create a cache that refuses inserts once `max_size` total bytes of
    /// code are resident.
    pub fn new(max_size: usize) -> Self {
        CodeCache {
            entries: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(0),
            total_code_size: AtomicUsize::new(0),
            max_size,
        }
    }

    /// Mint a fresh id for a not-yet-inserted entry.
    pub fn alloc_id(&self) -> CacheId {
        CacheId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert placed code under `id`. Returns `false` (without mutating the
    /// cache) if doing so would exceed `max_size`.
    pub fn insert(&self, id: CacheId, code: ExecutableCode) -> bool {
        let size = code.code_size();
        let current = self.total_code_size.load(Ordering::Relaxed);
        if current + size > self.max_size {
            return false;
        }
        let mut entries = self.entries.write();
        if let Some(old) = entries.remove(&id) {
            self.total_code_size.fetch_sub(old.code.code_size(), Ordering::Relaxed);
        }
        self.total_code_size.fetch_add(size, Ordering::Relaxed);
        entries.insert(id, CacheEntry { code, invalidated: AtomicBool::new(false) });
        true
    }

    /// True if `id` names live (non-invalidated) code.
    pub fn contains(&self, id: CacheId) -> bool {
        let entries = self.entries.read();
        entries.get(&id).map(|e| !e.invalidated.load(Ordering::Acquire)).unwrap_or(false)
    }

    /// Run `f` with a repatch scope over `id`'s code, if present and live.
    /// Returns `None` if the entry is missing or invalidated.
    pub fn with_repatch<R>(&self, id: CacheId, f: impl FnOnce(&mut RepatchBuffer<'_>) -> R) -> Option<R> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id)?;
        if entry.invalidated.load(Ordering::Acquire) {
            return None;
        }
        let mut buf = RepatchBuffer::new(&mut entry.code);
        Some(f(&mut buf))
    }

    /// Mark `id`'s code as no longer callable — used on recompile/flush.
    /// The entry stays resident (its bytes may still be referenced by a
    /// tree-linked guard elsewhere) until [`remove`](CodeCache::remove)
    /// reclaims it.
    pub fn invalidate(&self, id: CacheId) {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(&id) {
            entry.invalidated.store(true, Ordering::Release);
        }
    }

    /// Remove and return `id`'s code entirely, releasing its accounted
    /// size. Used by the Recompiler's code-release step and by global
    /// flush.
    pub fn remove(&self, id: CacheId) -> Option<ExecutableCode> {
        let mut entries = self.entries.write();
        let entry = entries.remove(&id)?;
        self.total_code_size.fetch_sub(entry.code.code_size(), Ordering::Relaxed);
        Some(entry.code)
    }

    /// Total bytes of code currently resident, invalidated or not.
    pub fn total_size(&self) -> usize {
        self.total_code_size.load(Ordering::Relaxed)
    }

    /// Number of entries currently resident.
    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Drop every entry. Used by a global cache flush.
    pub fn clear(&self) {
        self.entries.write().clear();
        self.total_code_size.store(0, Ordering::Relaxed);
    }
}

/// A backend that emits a single placeholder trap byte instead of real
/// machine code, for exercising the link/patch/cache pipeline in tests
/// without a real codegen dependency.
pub struct StubBackend;

impl CodegenBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn compile(&self, func: &AsmFunction) -> Result<CompiledCode, CodegenError> {
        let trap_byte = match self.target_info().arch {
            TargetArch::X86_64 => 0xCC,
            TargetArch::Aarch64 => 0x00,
        };
        let mut code = vec![trap_byte; func.ops.len().max(1)];
        // Reserve a slot for a relocation so tests can exercise LinkBuffer
        // even against the stub.
        if code.len() < 8 {
            code.resize(8, trap_byte);
        }
        Ok(CompiledCode { code, entry_offset: 0, stack_maps: vec![], deopt_info: vec![], relocations: vec![] })
    }

    fn finalize(&self, code: CompiledCode, resolver: &dyn SymbolResolver) -> Result<ExecutableCode, CodegenError> {
        LinkBuffer::link(code, resolver)
    }

    fn target_info(&self) -> TargetInfo {
        #[cfg(target_arch = "x86_64")]
        {
            TargetInfo { arch: TargetArch::X86_64, pointer_size: 8 }
        }
        #[cfg(target_arch = "aarch64")]
        {
            TargetInfo { arch: TargetArch::Aarch64, pointer_size: 8 }
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            TargetInfo { arch: TargetArch::X86_64, pointer_size: 8 }
        }
    }
}

struct NoopResolver;
impl SymbolResolver for NoopResolver {
    fn resolve_runtime_helper(&self, _: RuntimeHelper) -> Option<usize> {
        Some(0)
    }
    fn resolve_fragment(&self, _: u32) -> Option<usize> {
        Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AsmBuffer, AsmOp, Operand, Reg};

    fn tiny_func() -> AsmFunction {
        let mut buf = AsmBuffer::new();
        buf.push(AsmOp::Move { dest: Reg(0), src: Operand::ImmI32(1) });
        buf.push(AsmOp::Return { value: Some(Operand::Reg(Reg(0))) });
        buf.finish().unwrap()
    }

    #[test]
    fn cache_insert_and_contains() {
        let cache = CodeCache::new(1024);
        let id = cache.alloc_id();
        assert!(!cache.contains(id));

        let backend = StubBackend;
        let compiled = backend.compile(&tiny_func()).unwrap();
        let exe = backend.finalize(compiled, &NoopResolver).unwrap();
        assert!(cache.insert(id, exe));
        assert!(cache.contains(id));
    }

    #[test]
    fn cache_full_rejects_insert() {
        let cache = CodeCache::new(4);
        let id = cache.alloc_id();
        let backend = StubBackend;
        let compiled = backend.compile(&tiny_func()).unwrap();
        let exe = backend.finalize(compiled, &NoopResolver).unwrap();
        assert!(!cache.insert(id, exe));
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn invalidate_hides_without_removing() {
        let cache = CodeCache::new(1024);
        let id = cache.alloc_id();
        let backend = StubBackend;
        let compiled = backend.compile(&tiny_func()).unwrap();
        let exe = backend.finalize(compiled, &NoopResolver).unwrap();
        cache.insert(id, exe);

        cache.invalidate(id);
        assert!(!cache.contains(id));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn repatch_rewrites_bytes_in_place() {
        let cache = CodeCache::new(1024);
        let id = cache.alloc_id();
        let backend = StubBackend;
        let compiled = backend.compile(&tiny_func()).unwrap();
        let exe = backend.finalize(compiled, &NoopResolver).unwrap();
        cache.insert(id, exe);

        cache.with_repatch(id, |buf| buf.repatch_address(0, 0xdead_beef)).unwrap();
        let read_back = cache
            .with_repatch(id, |buf| u64::from_le_bytes(buf.peek(0, 8).try_into().unwrap()))
            .unwrap();
        assert_eq!(read_back, 0xdead_beef);
    }

    #[test]
    fn link_buffer_resolves_relocations() {
        let mut compiled = CompiledCode {
            code: vec![0u8; 16],
            entry_offset: 0,
            stack_maps: vec![],
            deopt_info: vec![],
            relocations: vec![crate::backend::Relocation {
                code_offset: 4,
                target: crate::backend::RelocationTarget::Absolute(0x1234),
            }],
        };
        compiled.code.resize(16, 0);
        let exe = LinkBuffer::link(compiled, &NoopResolver).unwrap();
        let patched = u64::from_le_bytes(exe.code[4..12].try_into().unwrap());
        assert_eq!(patched, 0x1234);
    }

    #[test]
    fn unresolved_relocation_is_an_error() {
        struct DenyAll;
        impl SymbolResolver for DenyAll {
            fn resolve_runtime_helper(&self, _: RuntimeHelper) -> Option<usize> {
                None
            }
            fn resolve_fragment(&self, _: u32) -> Option<usize> {
                None
            }
        }
        let compiled = CompiledCode {
            code: vec![0u8; 16],
            entry_offset: 0,
            stack_maps: vec![],
            deopt_info: vec![],
            relocations: vec![crate::backend::Relocation {
                code_offset: 0,
                target: crate::backend::RelocationTarget::Fragment(3),
            }],
        };
        assert!(LinkBuffer::link(compiled, &DenyAll).is_err());
    }
}
