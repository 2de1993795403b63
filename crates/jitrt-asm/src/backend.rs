//! The backend-agnostic code generation boundary.
//!
//! Neither JIT tier emits machine code directly: they build an
//! [`crate::ir::AsmFunction`] and hand it to a [`CodegenBackend`]. The low-
//! level macro-assembler, linker, and executable-page allocator live behind
//! this trait; the pack's own backend is Cranelift, wired up the same way
//! here.

use crate::ir::{AsmFunction, RuntimeHelper};

/// Target architecture the backend is generating code for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    Aarch64,
}

#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub pointer_size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("unsupported pseudo-op at index {0}")]
    UnsupportedOp(usize),
    #[error("relocation target could not be resolved: {0:?}")]
    UnresolvedRelocation(RelocationTarget),
}

/// Where a relocation's patch target points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationTarget {
    RuntimeHelper(RuntimeHelper),
    Fragment(u32),
    Absolute(usize),
}

/// A patch the backend could not fully resolve at `compile` time (e.g. a
/// call to a runtime helper or another fragment whose address is only
/// known at `finalize`).
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub code_offset: usize,
    pub target: RelocationTarget,
}

/// Where a GC-visible pointer lives at a recorded safepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerLocation {
    Register(u16),
    StackOffset(i32),
}

#[derive(Debug, Clone)]
pub struct StackMapEntry {
    pub code_offset: usize,
    pub live_pointers: Vec<PointerLocation>,
}

/// State needed to resume the interpreter after a guard/deopt fires at
/// `code_offset`.
#[derive(Debug, Clone)]
pub struct DeoptInfo {
    pub code_offset: usize,
    pub bytecode_offset: usize,
    pub register_map: Vec<(PointerLocation, u16)>,
}

/// Machine code produced by `compile`, not yet placed in executable memory.
#[derive(Debug)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    pub entry_offset: usize,
    pub stack_maps: Vec<StackMapEntry>,
    pub deopt_info: Vec<DeoptInfo>,
    pub relocations: Vec<Relocation>,
}

/// Machine code after relocation and placement in executable memory.
///
/// Modeled here as an owned buffer rather than a raw pointer into mapped
/// pages: real engines place this in W^X-toggled executable memory, but the
/// core's contract with the backend only needs an address-stable region and
/// an entry offset, which an owned, never-reallocated `Vec<u8>` satisfies
/// for everything above this boundary.
#[derive(Debug)]
pub struct ExecutableCode {
    pub code: Vec<u8>,
    pub entry_offset: usize,
    pub stack_maps: Vec<StackMapEntry>,
    pub deopt_info: Vec<DeoptInfo>,
}

impl ExecutableCode {
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    pub fn entry_ptr(&self) -> *const u8 {
        // Safety: callers must not dereference this outside the lifetime of
        // `self`; it exists so a `CodeCache` can hand out a stable address
        // without cloning the backing buffer.
        unsafe { self.code.as_ptr().add(self.entry_offset) }
    }
}

/// Resolves symbolic relocation targets to addresses at `finalize` time.
pub trait SymbolResolver {
    fn resolve_runtime_helper(&self, helper: RuntimeHelper) -> Option<usize>;
    fn resolve_fragment(&self, id: u32) -> Option<usize>;
}

/// The backend-agnostic code generation trait.
///
/// Pipeline: `AsmFunction -> compile() -> CompiledCode -> finalize() ->
/// ExecutableCode`. `compile` never fails for a well-formed `AsmFunction`
/// except on resource exhaustion; structural errors are caught earlier, at
/// `AsmBuffer::finish`.
pub trait CodegenBackend: Send + Sync {
    fn name(&self) -> &str;

    fn compile(&self, func: &AsmFunction) -> Result<CompiledCode, CodegenError>;

    fn finalize(&self, code: CompiledCode, resolver: &dyn SymbolResolver) -> Result<ExecutableCode, CodegenError>;

    fn target_info(&self) -> TargetInfo;
}
