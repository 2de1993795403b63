//! Inline caches: the monomorphic (MIC) and polymorphic (PIC) patchable
//! call-site records the `MethodCompiler` emits for property accesses,
//! global loads, and call sites.

use jitrt_asm::ir::Label;
use jitrt_vm::bytecode::ShapeId;

/// The stub-chain length cap. Once a PIC has generated this many stubs, no
/// further stubs are attempted for that site even on a later miss — it
/// falls through to the generic slow path on every subsequent miss rather
/// than growing without bound. Whether a larger cap than 16 would ever be
/// observable as a correctness difference (rather than a pure throughput
/// one) is open — see the crate's design notes.
pub const MAX_STUBS: usize = 16;

/// What kind of access an inline cache was generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcKind {
    Get,
    Set,
    Name,
    Bind,
    Call,
    CallGlobal,
    SetGlobal,
    GetElem,
    SetElem,
    Length,
}

/// A single generated stub in a PIC's chain: the shape it guards against,
/// the slot offset it was resolved to, and whether resolution required a
/// prototype-chain walk (one more guard before the final load/store).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stub {
    pub shape: ShapeId,
    pub slot_offset: u32,
    pub via_prototype: bool,
}

/// Why the resolver declined to generate a stub for an otherwise-missed
/// access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubRejection {
    ChainFull,
    ScriptedGetter,
    SealedOrBrandMismatch,
}

/// A patchable inline-cache site: label set, last-observed shape/offset,
/// the atom being looked up, and (for PIC kinds) the stub chain.
pub struct InlineCache {
    pub kind: IcKind,
    pub entry: Label,
    pub fast_path: Label,
    pub slow_path: Label,
    pub storeback: Label,
    pub atom_id: u32,
    last_shape: Option<ShapeId>,
    last_slot_offset: Option<u32>,
    stubs: Vec<Stub>,
    hits: u64,
    misses: u64,
}

impl InlineCache {
    pub fn new(kind: IcKind, atom_id: u32, entry: Label, fast_path: Label, slow_path: Label, storeback: Label) -> Self {
        InlineCache {
            kind,
            entry,
            fast_path,
            slow_path,
            storeback,
            atom_id,
            last_shape: None,
            last_slot_offset: None,
            stubs: Vec::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn is_polymorphic(&self) -> bool {
        matches!(self.kind, IcKind::Get | IcKind::Set | IcKind::Call | IcKind::GetElem | IcKind::SetElem | IcKind::Length)
    }

    pub fn hit_count(&self) -> u64 {
        self.hits
    }

    pub fn miss_count(&self) -> u64 {
        self.misses
    }

    pub fn stub_count(&self) -> usize {
        self.stubs.len()
    }

    /// A MIC hit: the inline shape guard matched.
    pub fn record_mic_hit(&mut self, shape: ShapeId) {
        debug_assert_eq!(self.last_shape, Some(shape), "MIC hit recorded against the wrong shape");
        self.hits += 1;
    }

    /// Install the MIC's only guarded shape/offset pair (first miss, or
    /// a reset inline path being re-seeded).
    pub fn patch_mic(&mut self, shape: ShapeId, slot_offset: u32) {
        self.last_shape = Some(shape);
        self.last_slot_offset = Some(slot_offset);
    }

    pub fn mic_shape(&self) -> Option<ShapeId> {
        self.last_shape
    }

    pub fn mic_slot_offset(&self) -> Option<u32> {
        self.last_slot_offset
    }

    /// A PIC miss at `shape`. Returns `Ok(stub)` if a new stub should be
    /// generated and appended to the chain (the caller assembles the
    /// actual guard/load code and patches the previous tail to jump to
    /// it), or `Err` naming why not.
    pub fn try_add_stub(&mut self, shape: ShapeId, slot_offset: u32, via_prototype: bool, cacheable: bool) -> Result<Stub, StubRejection> {
        self.misses += 1;
        if !cacheable {
            return Err(StubRejection::ScriptedGetter);
        }
        if self.stubs.len() >= MAX_STUBS {
            return Err(StubRejection::ChainFull);
        }
        let stub = Stub { shape, slot_offset, via_prototype };
        self.stubs.push(stub);
        Ok(stub)
    }

    pub fn stubs(&self) -> &[Stub] {
        &self.stubs
    }

    /// Find whether `shape` is already covered (by the MIC's inline guard
    /// or by a chained stub) so a repeated miss on the same shape doesn't
    /// generate a duplicate stub.
    pub fn covers_shape(&self, shape: ShapeId) -> bool {
        self.last_shape == Some(shape) || self.stubs.iter().any(|s| s.shape == shape)
    }

    /// Reset to the initial inline-only state. Invoked on recompilation of
    /// the owning script; the executable pool backing `self.stubs`'
    /// generated code is released by the caller (this crate doesn't own
    /// that memory — `jitrt_asm::CodeCache` does).
    pub fn reset(&mut self) {
        self.last_shape = None;
        self.last_slot_offset = None;
        self.stubs.clear();
        self.hits = 0;
        self.misses = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ic(kind: IcKind) -> InlineCache {
        InlineCache::new(kind, 1, Label(0), Label(1), Label(2), Label(3))
    }

    #[test]
    fn first_miss_seeds_mic_then_hits_on_matching_shape() {
        let mut cache = ic(IcKind::Get);
        cache.patch_mic(ShapeId(10), 4);
        cache.record_mic_hit(ShapeId(10));
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(cache.mic_shape(), Some(ShapeId(10)));
    }

    #[test]
    fn pic_chain_caps_at_max_stubs() {
        let mut cache = ic(IcKind::Get);
        for i in 0..MAX_STUBS {
            let stub = cache.try_add_stub(ShapeId(i as u64), i as u32 * 8, false, true).unwrap();
            assert_eq!(stub.shape, ShapeId(i as u64));
        }
        let rejected = cache.try_add_stub(ShapeId(999), 0, false, true);
        assert_eq!(rejected, Err(StubRejection::ChainFull));
        assert_eq!(cache.stub_count(), MAX_STUBS);
    }

    #[test]
    fn uncacheable_access_is_rejected_without_consuming_a_slot() {
        let mut cache = ic(IcKind::Set);
        let rejected = cache.try_add_stub(ShapeId(1), 0, false, false);
        assert_eq!(rejected, Err(StubRejection::ScriptedGetter));
        assert_eq!(cache.stub_count(), 0);
    }

    #[test]
    fn reset_clears_chain_and_counters() {
        let mut cache = ic(IcKind::Get);
        cache.try_add_stub(ShapeId(1), 8, false, true).unwrap();
        cache.patch_mic(ShapeId(1), 8);
        cache.reset();
        assert_eq!(cache.stub_count(), 0);
        assert_eq!(cache.mic_shape(), None);
        assert_eq!(cache.hit_count(), 0);
    }

    #[test]
    fn covers_shape_checks_both_mic_and_chain() {
        let mut cache = ic(IcKind::Get);
        cache.patch_mic(ShapeId(1), 0);
        cache.try_add_stub(ShapeId(2), 8, false, true).unwrap();
        assert!(cache.covers_shape(ShapeId(1)));
        assert!(cache.covers_shape(ShapeId(2)));
        assert!(!cache.covers_shape(ShapeId(3)));
    }
}
