//! `StackFrame`: the fixed header for one function activation.
//!
//! Followed inline (in the backing `StackSpace`) by the frame's local
//! variables and expression stack, in that order. The frame chain is a
//! singly-linked list via `prev`; `prev` is never rewritten after a frame is
//! pushed except by the Recompiler's frame-expansion operation, which
//! inserts synthetic frames for previously-inlined calls.

/// Where execution should resume after a recompile invalidates the code
/// that was running this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejoinState {
    /// No recompile in flight; resume normally.
    None,
    /// Resume interpretation at this bytecode offset.
    ScriptedPc(usize),
    /// Resume via a stub-call rejoin of the given kind (native call,
    /// variadic args, trap, ...). The `u16` identifies the stub kind; it is
    /// opaque to this crate and interpreted by the embedder/Recompiler.
    Stub(u16),
}

/// Per-frame flag bits (constructing/eval/generator/has-call-object/...).
/// Hand-rolled as a plain `u16` newtype rather than a bitflags-style macro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u16);

impl FrameFlags {
    pub const CONSTRUCTING: FrameFlags = FrameFlags(1 << 0);
    pub const EVAL: FrameFlags = FrameFlags(1 << 1);
    pub const GENERATOR: FrameFlags = FrameFlags(1 << 2);
    pub const HAS_CALL_OBJECT: FrameFlags = FrameFlags(1 << 3);
    pub const FLOATING: FrameFlags = FrameFlags(1 << 4);
    /// Set by the Recompiler on frames it synthesized via frame expansion,
    /// distinguishing them from frames the interpreter itself pushed.
    pub const SYNTHESIZED: FrameFlags = FrameFlags(1 << 5);

    pub const fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn insert(&mut self, other: FrameFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FrameFlags) {
        self.0 &= !other.0;
    }

    pub fn contains(&self, other: FrameFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Identifies which script (function) a frame is executing. The script/
/// object model is external; this is only the opaque handle the core moves
/// around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptId(pub u32);

/// The fixed-size frame header. Locals and the expression stack for this
/// frame live immediately after it in the backing `StackSpace`, at
/// `slots.start + size_of_header` (modeled here simply as the frame's own
/// `SlotRange` covering header-equivalent bookkeeping plus payload).
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Index of the calling frame in the owning `ContextStack`'s frame
    /// table, or `None` for the outermost frame of a segment.
    pub prev: Option<usize>,
    pub script: ScriptId,
    /// Callee object reference, if this is a scripted call (vs. top-level).
    pub callee: Option<u32>,
    /// `this` value slot index within the frame's payload range.
    pub receiver_slot: usize,
    /// Start of argv within the backing `StackSpace`.
    pub argv_base: usize,
    pub argc: u32,
    /// Slot index holding the return value once the frame returns.
    pub return_value_slot: usize,
    /// Bytecode PC saved when this frame is suspended (not currently
    /// executing — e.g. it called another function).
    pub saved_pc: usize,
    /// Opaque scope-chain handle (object model detail).
    pub scope_chain: u32,
    pub flags: FrameFlags,
    pub rejoin: RejoinState,
    /// Payload range: locals followed by the expression stack.
    pub locals_start: usize,
    pub local_count: usize,
    pub stack_base: usize,
}

impl StackFrame {
    pub fn new(
        prev: Option<usize>,
        script: ScriptId,
        argv_base: usize,
        argc: u32,
        locals_start: usize,
        local_count: usize,
    ) -> Self {
        StackFrame {
            prev,
            script,
            callee: None,
            receiver_slot: argv_base,
            argv_base,
            argc,
            return_value_slot: argv_base,
            saved_pc: 0,
            scope_chain: 0,
            flags: FrameFlags::empty(),
            rejoin: RejoinState::None,
            locals_start,
            local_count,
            stack_base: locals_start + local_count,
        }
    }

    pub fn is_constructing(&self) -> bool {
        self.flags.contains(FrameFlags::CONSTRUCTING)
    }

    pub fn is_generator(&self) -> bool {
        self.flags.contains(FrameFlags::GENERATOR)
    }

    pub fn is_synthesized(&self) -> bool {
        self.flags.contains(FrameFlags::SYNTHESIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_places_stack_after_locals() {
        let f = StackFrame::new(None, ScriptId(1), 0, 2, 2, 3);
        assert_eq!(f.stack_base, 5);
    }

    #[test]
    fn flags_roundtrip() {
        let mut f = StackFrame::new(None, ScriptId(1), 0, 0, 0, 0);
        f.flags.insert(FrameFlags::CONSTRUCTING);
        assert!(f.is_constructing());
        assert!(!f.is_generator());
    }
}
