//! Recompiler: on-stack frame expansion and return-address repatching.
//!
//! Triggered by a debugger trap toggle, an Oracle-driven type
//! reinterpretation, or an inline-expansion request from the trace tier.
//! Does not itself own stack memory — it walks a caller-supplied sequence
//! of native return addresses (opaque `usize`s standing in for machine
//! pointers) and a `CallSite` table, producing the rewrites the embedder's
//! native call stack must apply.

use rustc_hash::FxHashMap;

/// `(codeOffset, inlineIndex, pcOffset, id)` — `id` disambiguates multiple
/// callsite records that share a PC (trap, return-from-scripted,
/// native-call, variadic-rejoin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub code_offset: usize,
    pub inline_index: u32,
    pub pc_offset: u32,
    pub id: CallSiteKind,
}

/// Disambiguates same-PC callsite records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSiteKind {
    Trap,
    ReturnFromScripted,
    NativeCallInProgress,
    VariadicRejoin,
}

/// Where a repatched frame should resume once it reenters the
/// interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejoinState {
    /// Resume scripted execution at this bytecode PC offset.
    Scripted(u32),
    /// Resume inside a specific stub continuation.
    Stub(u16),
}

/// Which trampoline a repatched return address should point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpoline {
    /// For returns from a native stub call.
    Stub,
    /// For returns from what was (from the caller's perspective) a
    /// scripted call.
    Scripted,
}

/// One rewrite the embedder must apply to a specific on-stack native
/// return address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnAddressPatch {
    pub frame_index: usize,
    pub rejoin: RejoinState,
    pub trampoline: Interpoline,
}

/// A saved descriptor for a call that MethodJIT inlined directly into its
/// caller's frame, letting the Recompiler synthesize a real `StackFrame`
/// for it later.
#[derive(Debug, Clone, Copy)]
pub struct InlineFrameDescriptor {
    pub caller_frame_index: usize,
    pub callee_script: u32,
    pub slot_area_offset: usize,
    pub slot_count: usize,
}

/// One on-stack native frame the recompiler is asked to examine, as seen
/// from the embedder: its current return address (an opaque code
/// location) and whether it is mid-native-call.
#[derive(Debug, Clone, Copy)]
pub struct ObservedFrame {
    pub return_address: usize,
    pub in_native_call: bool,
}

/// The outcome of walking one `ObservedFrame`: either nothing needed
/// patching (the return address doesn't point into recompiled code), or
/// a concrete rewrite plus, if the frame was inlined, the descriptor the
/// embedder should use to materialize a real frame for it.
#[derive(Debug, Clone)]
pub enum FrameOutcome {
    Unaffected,
    Expanded { patch: ReturnAddressPatch, inline_frame: Option<InlineFrameDescriptor> },
}

/// Per-compartment recompilation bookkeeping and counters.
#[derive(Default)]
pub struct Recompiler {
    callsites: FxHashMap<usize, CallSite>,
    inline_frames: FxHashMap<usize, InlineFrameDescriptor>,
    recompilations: u64,
    frame_expansions: u64,
}

impl Recompiler {
    pub fn new() -> Self {
        Recompiler::default()
    }

    /// Register a callsite table entry, keyed by the native code offset a
    /// return address would equal if it returned exactly there.
    pub fn register_callsite(&mut self, code_offset: usize, site: CallSite) {
        self.callsites.insert(code_offset, site);
    }

    /// Register that the call at `code_offset` was inlined, so a frame
    /// returning there needs expansion rather than a plain patch.
    pub fn register_inline_frame(&mut self, code_offset: usize, descriptor: InlineFrameDescriptor) {
        self.inline_frames.insert(code_offset, descriptor);
    }

    pub fn recompilations(&self) -> u64 {
        self.recompilations
    }

    pub fn frame_expansions(&self) -> u64 {
        self.frame_expansions
    }

    /// Walk every observed frame and compute the rewrite (if any) each one
    /// needs. Frames whose return address isn't in `self.callsites` are
    /// reported `Unaffected` — they don't point into the script being
    /// recompiled.
    pub fn plan_patches(&mut self, frames: &[ObservedFrame]) -> Vec<FrameOutcome> {
        frames
            .iter()
            .enumerate()
            .map(|(idx, frame)| self.plan_one(idx, frame))
            .collect()
    }

    fn plan_one(&mut self, idx: usize, frame: &ObservedFrame) -> FrameOutcome {
        let Some(&site) = self.callsites.get(&frame.return_address) else {
            return FrameOutcome::Unaffected;
        };

        let rejoin = match site.id {
            CallSiteKind::Trap | CallSiteKind::ReturnFromScripted | CallSiteKind::VariadicRejoin => {
                RejoinState::Scripted(site.pc_offset)
            }
            CallSiteKind::NativeCallInProgress => RejoinState::Stub(site.inline_index as u16),
        };

        // A native-call-in-progress frame keeps its fallthrough jump but
        // gets rewritten to the interpoline so control returns to the
        // interpreter once the in-flight native call completes; its IC
        // stub pool must be orphaned by the caller rather than freed.
        let trampoline = if frame.in_native_call || site.id == CallSiteKind::NativeCallInProgress {
            Interpoline::Stub
        } else {
            Interpoline::Scripted
        };

        let inline_frame = self.inline_frames.get(&frame.return_address).copied();
        if inline_frame.is_some() {
            self.frame_expansions += 1;
        }

        FrameOutcome::Expanded { patch: ReturnAddressPatch { frame_index: idx, rejoin, trampoline }, inline_frame }
    }

    /// Record that a recompilation happened (bumps the counter and resets
    /// affected ICs and code, which the caller performs using the
    /// `InlineCache`/code-cache APIs — this method is purely bookkeeping).
    pub fn note_recompilation(&mut self) {
        self.recompilations += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_return_address_is_unaffected() {
        let mut recompiler = Recompiler::new();
        let frames = [ObservedFrame { return_address: 0x1000, in_native_call: false }];
        let outcomes = recompiler.plan_patches(&frames);
        assert!(matches!(outcomes[0], FrameOutcome::Unaffected));
    }

    #[test]
    fn scripted_return_patches_to_scripted_interpoline() {
        let mut recompiler = Recompiler::new();
        recompiler.register_callsite(
            0x2000,
            CallSite { code_offset: 0x2000, inline_index: 0, pc_offset: 42, id: CallSiteKind::ReturnFromScripted },
        );
        let frames = [ObservedFrame { return_address: 0x2000, in_native_call: false }];
        let outcomes = recompiler.plan_patches(&frames);
        match &outcomes[0] {
            FrameOutcome::Expanded { patch, inline_frame } => {
                assert_eq!(patch.rejoin, RejoinState::Scripted(42));
                assert_eq!(patch.trampoline, Interpoline::Scripted);
                assert!(inline_frame.is_none());
            }
            other => panic!("expected Expanded, got {other:?}"),
        }
    }

    #[test]
    fn native_call_in_progress_always_uses_stub_interpoline() {
        let mut recompiler = Recompiler::new();
        recompiler.register_callsite(
            0x3000,
            CallSite { code_offset: 0x3000, inline_index: 7, pc_offset: 9, id: CallSiteKind::NativeCallInProgress },
        );
        let frames = [ObservedFrame { return_address: 0x3000, in_native_call: true }];
        let outcomes = recompiler.plan_patches(&frames);
        match &outcomes[0] {
            FrameOutcome::Expanded { patch, .. } => {
                assert_eq!(patch.trampoline, Interpoline::Stub);
                assert_eq!(patch.rejoin, RejoinState::Stub(7));
            }
            other => panic!("expected Expanded, got {other:?}"),
        }
    }

    #[test]
    fn inlined_call_site_produces_a_frame_descriptor_and_bumps_expansions() {
        let mut recompiler = Recompiler::new();
        recompiler.register_callsite(
            0x4000,
            CallSite { code_offset: 0x4000, inline_index: 0, pc_offset: 5, id: CallSiteKind::ReturnFromScripted },
        );
        recompiler.register_inline_frame(
            0x4000,
            InlineFrameDescriptor { caller_frame_index: 0, callee_script: 1, slot_area_offset: 16, slot_count: 4 },
        );
        let frames = [ObservedFrame { return_address: 0x4000, in_native_call: false }];
        let outcomes = recompiler.plan_patches(&frames);
        match &outcomes[0] {
            FrameOutcome::Expanded { inline_frame: Some(desc), .. } => {
                assert_eq!(desc.callee_script, 1);
            }
            other => panic!("expected an inline frame descriptor, got {other:?}"),
        }
        assert_eq!(recompiler.frame_expansions(), 1);
    }
}
