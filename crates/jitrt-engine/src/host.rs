//! Host/embedder-facing operations from the design's external-interfaces
//! section: `mark_stack` (the GC's contract with the stack) and
//! `expand_inline_frames` (making inlined calls visible to the frame chain
//! before the host walks it, e.g. for exception handling or a debugger
//! stack dump). Both take a caller-owned `ContextStack` by reference
//! rather than living on `Engine`, since stack memory belongs to exactly
//! one execution context at a time (§5) and `Engine` owns none of it.

use jitrt_method::{FrameOutcome, ObservedFrame, Recompiler};
use jitrt_vm::{ContextStack, FrameRegsIter, GcRootVisitor, SlotRange, ValueRepr};

/// How much of a context's frame chain `expand_inline_frames` should
/// cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionScope {
    /// Expand every frame in the chain — before a full GC mark or a
    /// debugger stack walk.
    AllFrames,
    /// Expand only the currently executing frame — the common case of an
    /// exception about to unwind through it.
    TopmostOnly,
}

/// Walk `context`'s frame chain precisely — every live slot in every
/// frame's locals-and-expression-stack range — and hand the gaps between
/// frames to `tracer` conservatively, via `StackSpace::mark`. This derives
/// the live ranges from the frame chain itself rather than requiring the
/// caller to already know them, satisfying §6's `mark_stack(tracer)`
/// contract ("invoked at GC time; walks every segment").
pub fn mark_stack<V: ValueRepr>(context: &ContextStack<V>, tracer: &mut impl GcRootVisitor<V>) {
    let mut live_ranges: Vec<SlotRange> = FrameRegsIter::new(context)
        .filter_map(|regs| {
            let frame = context.frame_at(regs.fp)?;
            Some(SlotRange { start: frame.locals_start, end: regs.sp })
        })
        .collect();
    live_ranges.sort_by_key(|r| r.start);
    context.space().mark(tracer, &live_ranges);
}

/// §6 `expand_inline_frames(context, all_or_topmost)`: ask the
/// `Recompiler` what it knows about every native return address the
/// context's frame chain currently presents (this workspace's frames
/// carry their suspended bytecode PC as that opaque return-address
/// analog, the same convention `CallSite`/`Recompiler` already use for
/// code offsets), returning the patches — and, where a call was inlined,
/// the descriptor needed to synthesize a real frame for it — the embedder
/// must apply before it inspects frames. Actually splicing a synthesized
/// `StackFrame` into the context's frame table is the embedder's concern,
/// since only it owns the frame-table layout that would mutate.
pub fn expand_inline_frames<V: ValueRepr>(
    context: &ContextStack<V>,
    recompiler: &mut Recompiler,
    scope: ExpansionScope,
) -> Vec<FrameOutcome> {
    let limit = match scope {
        ExpansionScope::AllFrames => usize::MAX,
        ExpansionScope::TopmostOnly => 1,
    };
    let observed: Vec<ObservedFrame> = FrameRegsIter::new(context)
        .take(limit)
        .map(|regs| ObservedFrame { return_address: regs.pc, in_native_call: false })
        .collect();
    recompiler.plan_patches(&observed)
}
