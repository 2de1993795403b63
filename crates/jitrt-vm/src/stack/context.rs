//! `ContextStack`: one execution context's view over a shared `StackSpace`.
//!
//! Owns the frame table and the segment table for a single context, plus
//! the live `FrameRegs` for whichever frame is currently executing. Pushing
//! a call reserves space for its arguments first (so a native call that
//! never actually invokes a scripted function can unwind cheaply), then
//! promotes that reservation into a real `StackFrame` only once the callee
//! is known to be scripted.
//!
//! Every push returns a guard whose `Drop` undoes exactly that push; guards
//! must be dropped in the reverse order they were acquired (the same LIFO
//! discipline `StackSpace` itself enforces with debug assertions).

use crate::stack::frame::{FrameFlags, RejoinState, ScriptId, StackFrame};
use crate::stack::segment::{FrameRegs, StackSegment};
use crate::stack::space::{SlotRange, StackSpace, StackSpaceError};
use crate::value::ValueRepr;
use std::ops::Range;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContextStackError {
    #[error(transparent)]
    Space(#[from] StackSpaceError),
    #[error("no active frame in this context")]
    NoActiveFrame,
    #[error("frame is not a floating generator frame")]
    NotFloating,
}

/// A generator's frame, parked outside live stack space between resumes.
/// The object model owns the generator object itself; this is only the
/// slice of stack state the context needs to relocate on resume.
#[derive(Debug, Clone)]
pub struct FloatingFrame<V> {
    pub template: StackFrame,
    pub locals_and_stack: Vec<V>,
}

pub struct ContextStack<V: ValueRepr> {
    space: StackSpace<V>,
    segments: Vec<StackSegment>,
    frames: Vec<StackFrame>,
    /// Index of this context's currently active segment, or `None` before
    /// the first segment is pushed.
    active_segment: Option<usize>,
    regs: FrameRegs,
}

impl<V: ValueRepr> ContextStack<V> {
    pub fn new() -> Self {
        ContextStack {
            space: StackSpace::new(),
            segments: Vec::new(),
            frames: Vec::new(),
            active_segment: None,
            regs: FrameRegs::default(),
        }
    }

    pub fn regs(&self) -> FrameRegs {
        self.regs
    }

    pub fn space(&self) -> &StackSpace<V> {
        &self.space
    }

    /// Look up a frame by its index in this context's frame table. Used by
    /// GC marking and inline-frame expansion, which both need the frame's
    /// payload range alongside the `(fp, sp, pc)` triple `FrameRegsIter`
    /// yields.
    pub fn frame_at(&self, fp: usize) -> Option<&StackFrame> {
        self.frames.get(fp)
    }

    pub fn current_frame(&self) -> Option<&StackFrame> {
        self.frames.get(self.regs.fp)
    }

    fn push_new_segment(&mut self, size: usize) -> Result<usize, ContextStackError> {
        let slots = self.space.push_segment(size)?;
        let prev_in_memory = self.segments.len().checked_sub(1);
        let prev_in_context = self.active_segment;
        if let Some(idx) = self.active_segment {
            self.segments[idx].suspend(self.regs);
        }
        self.segments.push(StackSegment::new(slots, prev_in_memory, prev_in_context));
        let idx = self.segments.len() - 1;
        self.active_segment = Some(idx);
        Ok(idx)
    }

    /// Pop the active segment, reactivating whichever segment it suspended
    /// (if any) and restoring its saved regs is the caller's responsibility
    /// via `saved_regs` captured at push time.
    fn pop_active_segment(&mut self, idx: usize, slots: SlotRange) {
        debug_assert_eq!(self.active_segment, Some(idx), "segments must pop in LIFO order");
        self.space.pop_segment(slots);
        self.active_segment = self.segments[idx].prev_in_context;
        if let Some(prev) = self.active_segment {
            self.segments[prev].resume();
        }
        self.segments.pop();
    }

    /// Reserve `argc + 2` slots (callee + receiver + argv) atop the current
    /// stack for an about-to-be-attempted call, without committing to a
    /// scripted invocation. If the call turns out to be native, the guard's
    /// `Drop` reclaims the reservation with no frame ever having existed.
    pub fn push_invoke_args(&mut self, argc: u32) -> Result<ArgsGuard<'_, V>, ContextStackError> {
        let reserved = self.space.push_segment(argc as usize + 2)?;
        Ok(ArgsGuard { stack: Some(self), reserved })
    }

    /// Top-level or `eval` execution: pushes a fresh segment (suspending
    /// whatever the context had active) and a frame within it whose `prev`
    /// may point at any existing frame (the debugger's "evaluate in frame").
    pub fn push_execute_frame(
        &mut self,
        script: ScriptId,
        scope: u32,
        local_count: usize,
        eval_in: Option<usize>,
    ) -> Result<FrameGuard<'_, V>, ContextStackError> {
        let seg_idx = self.push_new_segment(local_count)?;
        let locals = self.segments[seg_idx].slots;
        let mut frame = StackFrame::new(eval_in, script, locals.start, 0, locals.start, local_count);
        frame.scope_chain = scope;
        frame.flags.insert(FrameFlags::EVAL);
        self.frames.push(frame);
        let fp = self.frames.len() - 1;
        let saved_regs = self.regs;
        self.regs = FrameRegs { fp, sp: locals.end, pc: 0 };
        Ok(FrameGuard {
            stack: self,
            fp,
            args_range: locals.start..locals.start,
            locals_range: locals,
            segment: Some(seg_idx),
            saved_regs,
        })
    }

    /// Copy a suspended generator's saved frame back into live stack space,
    /// relocating its argv/locals pointers. The generator object itself
    /// (and the decision of which one to resume) is the embedder's concern;
    /// this only handles the stack-shape side of the resume.
    pub fn push_generator_frame(
        &mut self,
        floating: FloatingFrame<V>,
    ) -> Result<GenGuard<'_, V>, ContextStackError> {
        if !floating.template.is_generator() {
            return Err(ContextStackError::NotFloating);
        }
        let size = floating.locals_and_stack.len();
        let range = self.space.push_segment(size)?;
        for (i, v) in floating.locals_and_stack.into_iter().enumerate() {
            *self.space.slot_mut(range.start + i) = v;
        }
        let mut frame = floating.template;
        let delta = range.start as isize - frame.locals_start as isize;
        frame.locals_start = range.start;
        frame.stack_base = (frame.stack_base as isize + delta) as usize;
        frame.argv_base = (frame.argv_base as isize + delta) as usize;
        self.frames.push(frame);
        let fp = self.frames.len() - 1;
        let saved_regs = self.regs;
        self.regs = FrameRegs { fp, sp: range.end, pc: 0 };
        Ok(GenGuard { stack: self, fp, range, saved_regs })
    }

    /// Push a marker frame with no script, used for scope-only activations
    /// (`with` blocks and similar) that need a frame to hang a scope chain
    /// off of but never execute bytecode of their own.
    pub fn push_dummy_frame(&mut self, scope: u32) -> Result<FrameGuard<'_, V>, ContextStackError> {
        let prev = if self.frames.is_empty() { None } else { Some(self.regs.fp) };
        let range = self.space.push_segment(0)?;
        let mut frame = StackFrame::new(prev, ScriptId(u32::MAX), range.start, 0, range.start, 0);
        frame.scope_chain = scope;
        frame.flags.insert(FrameFlags::SYNTHESIZED);
        self.frames.push(frame);
        let fp = self.frames.len() - 1;
        let saved_regs = self.regs;
        self.regs = FrameRegs { fp, sp: range.end, pc: 0 };
        Ok(FrameGuard {
            stack: self,
            fp,
            args_range: range.start..range.start,
            locals_range: range,
            segment: None,
            saved_regs,
        })
    }

    fn pop_frame_raw(&mut self, fp: usize, args_range: Range<usize>, locals_range: SlotRange, segment: Option<usize>) {
        debug_assert_eq!(fp, self.frames.len() - 1, "frames must pop in LIFO order");
        if let Some(idx) = segment {
            self.pop_active_segment(idx, locals_range);
        } else {
            self.space.pop_segment(locals_range);
            if !args_range.is_empty() {
                self.space.pop_segment(SlotRange { start: args_range.start, end: args_range.end });
            }
        }
        self.frames.pop();
    }
}

impl<V: ValueRepr> Default for ContextStack<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Guards a raw argument reservation made by `push_invoke_args`. Either
/// consume it with `into_frame` once the callee turns out to be scripted,
/// or let it drop to reclaim the reservation untouched.
pub struct ArgsGuard<'a, V: ValueRepr> {
    stack: Option<&'a mut ContextStack<V>>,
    reserved: SlotRange,
}

impl<'a, V: ValueRepr> ArgsGuard<'a, V> {
    /// Promote the reservation into a real `StackFrame`, reserving
    /// `local_count` further slots for locals and the expression stack, and
    /// making the new frame current.
    pub fn into_frame(mut self, script: ScriptId, local_count: usize) -> Result<FrameGuard<'a, V>, ContextStackError> {
        let stack = self.stack.take().expect("ArgsGuard used exactly once");
        let argv_base = self.reserved.start;
        let argc = self.reserved.len() as u32 - 2;
        let prev = if stack.frames.is_empty() { None } else { Some(stack.regs.fp) };
        let locals = stack.space.push_segment(local_count)?;
        let frame = StackFrame::new(prev, script, argv_base, argc, locals.start, local_count);
        stack.frames.push(frame);
        let fp = stack.frames.len() - 1;
        let saved_regs = stack.regs;
        stack.regs = FrameRegs { fp, sp: locals.end, pc: 0 };
        Ok(FrameGuard {
            stack,
            fp,
            args_range: argv_base..argv_base + argc as usize + 2,
            locals_range: locals,
            segment: None,
            saved_regs,
        })
    }
}

impl<'a, V: ValueRepr> Drop for ArgsGuard<'a, V> {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.take() {
            stack.space.pop_segment(self.reserved);
        }
    }
}

/// Guards a pushed `StackFrame`. Dropping it pops the frame's locals/stack
/// region (and its argument reservation, if distinct), retires the segment
/// it created (if any), and restores the regs that were active before the
/// frame was pushed.
pub struct FrameGuard<'a, V: ValueRepr> {
    stack: &'a mut ContextStack<V>,
    fp: usize,
    args_range: Range<usize>,
    locals_range: SlotRange,
    segment: Option<usize>,
    saved_regs: FrameRegs,
}

impl<'a, V: ValueRepr> FrameGuard<'a, V> {
    pub fn frame(&self) -> &StackFrame {
        &self.stack.frames[self.fp]
    }

    pub fn frame_mut(&mut self) -> &mut StackFrame {
        &mut self.stack.frames[self.fp]
    }

    pub fn regs(&self) -> FrameRegs {
        self.stack.regs
    }

    pub fn set_pc(&mut self, pc: usize) {
        self.stack.regs.pc = pc;
    }
}

impl<'a, V: ValueRepr> Drop for FrameGuard<'a, V> {
    fn drop(&mut self) {
        self.stack.pop_frame_raw(self.fp, self.args_range.clone(), self.locals_range, self.segment);
        self.stack.regs = self.saved_regs;
    }
}

/// Guards a generator frame relocated into live stack space by
/// `push_generator_frame`. Dropping it (or calling `into_floating`) copies
/// the (possibly mutated) slots back out and releases the live reservation.
pub struct GenGuard<'a, V: ValueRepr> {
    stack: &'a mut ContextStack<V>,
    fp: usize,
    range: SlotRange,
    saved_regs: FrameRegs,
}

impl<'a, V: ValueRepr> GenGuard<'a, V> {
    pub fn frame_mut(&mut self) -> &mut StackFrame {
        &mut self.stack.frames[self.fp]
    }

    /// Snapshot the frame's current slot contents back into a
    /// `FloatingFrame`; the live reservation is released when the returned
    /// value's backing guard is dropped at the end of this call.
    pub fn into_floating(self) -> FloatingFrame<V> {
        let mut locals_and_stack = Vec::with_capacity(self.range.len());
        for i in self.range.start..self.range.end {
            locals_and_stack.push(*self.stack.space.slot(i));
        }
        let mut template = self.stack.frames[self.fp].clone();
        template.rejoin = RejoinState::None;
        FloatingFrame { template, locals_and_stack }
    }
}

impl<'a, V: ValueRepr> Drop for GenGuard<'a, V> {
    fn drop(&mut self) {
        self.stack.frames.pop();
        self.stack.space.pop_segment(self.range);
        self.stack.regs = self.saved_regs;
    }
}

/// Walks a context's frame chain from the current frame backwards, reading
/// saved regs out of segment headers whenever it steps across a segment
/// boundary (`prev` of a segment's initial frame may point into a prior
/// segment if the embedder re-entered).
pub struct FrameRegsIter<'a, V: ValueRepr> {
    stack: &'a ContextStack<V>,
    next: Option<usize>,
}

impl<'a, V: ValueRepr> FrameRegsIter<'a, V> {
    pub fn new(stack: &'a ContextStack<V>) -> Self {
        let next = if stack.frames.is_empty() { None } else { Some(stack.regs.fp) };
        FrameRegsIter { stack, next }
    }
}

impl<'a, V: ValueRepr> Iterator for FrameRegsIter<'a, V> {
    type Item = FrameRegs;

    fn next(&mut self) -> Option<FrameRegs> {
        let fp = self.next?;
        let frame = self.stack.frames.get(fp)?;
        let regs = if fp == self.stack.regs.fp {
            self.stack.regs
        } else {
            FrameRegs { fp, sp: frame.stack_base, pc: frame.saved_pc }
        };
        self.next = frame.prev;
        Some(regs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::PunboxValue;

    #[test]
    fn invoke_args_reclaimed_if_never_promoted() {
        let mut stack = ContextStack::<PunboxValue>::new();
        let before = stack.space().first_unused();
        {
            let _guard = stack.push_invoke_args(3).unwrap();
        }
        assert_eq!(stack.space().first_unused(), before);
    }

    #[test]
    fn invoke_frame_promotion_sets_current_frame() {
        let mut stack = ContextStack::<PunboxValue>::new();
        let guard = stack.push_invoke_args(2).unwrap();
        let frame_guard = guard.into_frame(ScriptId(7), 3).unwrap();
        assert_eq!(frame_guard.frame().script, ScriptId(7));
        assert_eq!(frame_guard.frame().argc, 2);
    }

    #[test]
    fn frame_guard_drop_restores_first_unused() {
        let mut stack = ContextStack::<PunboxValue>::new();
        let before = stack.space().first_unused();
        {
            let guard = stack.push_invoke_args(2).unwrap();
            let _frame_guard = guard.into_frame(ScriptId(1), 4).unwrap();
        }
        assert_eq!(stack.space().first_unused(), before);
    }

    #[test]
    fn execute_frame_accepts_eval_in_prev() {
        let mut stack = ContextStack::<PunboxValue>::new();
        let guard = stack.push_invoke_args(0).unwrap();
        let outer = guard.into_frame(ScriptId(1), 2).unwrap();
        let outer_fp = outer.regs().fp;
        drop(outer);

        let eval_guard = stack.push_execute_frame(ScriptId(2), 0, 1, Some(outer_fp)).unwrap();
        assert_eq!(eval_guard.frame().prev, Some(outer_fp));
    }

    #[test]
    fn execute_frame_drop_restores_first_unused_and_active_segment() {
        let mut stack = ContextStack::<PunboxValue>::new();
        let before = stack.space().first_unused();
        {
            let _eval_guard = stack.push_execute_frame(ScriptId(1), 0, 4, None).unwrap();
        }
        assert_eq!(stack.space().first_unused(), before);
        assert_eq!(stack.active_segment, None);
    }

    #[test]
    fn generator_roundtrip_preserves_locals() {
        let mut stack = ContextStack::<PunboxValue>::new();
        let mut template = StackFrame::new(None, ScriptId(3), 0, 0, 0, 2);
        template.flags.insert(FrameFlags::GENERATOR);
        let floating = FloatingFrame {
            template,
            locals_and_stack: vec![PunboxValue::from_int(1), PunboxValue::from_int(2)],
        };
        let gen_guard = stack.push_generator_frame(floating).unwrap();
        let restored = gen_guard.into_floating();
        assert_eq!(restored.locals_and_stack[0].as_int(), Some(1));
        assert_eq!(restored.locals_and_stack[1].as_int(), Some(2));
    }

    #[test]
    fn dummy_frame_carries_scope_with_no_script() {
        let mut stack = ContextStack::<PunboxValue>::new();
        let guard = stack.push_dummy_frame(42).unwrap();
        assert_eq!(guard.frame().scope_chain, 42);
        assert_eq!(guard.frame().local_count, 0);
    }

    #[test]
    fn frame_regs_iter_walks_chain() {
        let mut stack = ContextStack::<PunboxValue>::new();
        stack.frames.push(StackFrame::new(None, ScriptId(1), 0, 0, 0, 0));
        stack.frames.push(StackFrame::new(Some(0), ScriptId(2), 0, 0, 0, 0));
        stack.regs = FrameRegs { fp: 1, sp: 0, pc: 7 };

        let regs: Vec<_> = FrameRegsIter::new(&stack).collect();
        assert_eq!(regs.len(), 2);
        assert_eq!(regs[0].fp, 1);
        assert_eq!(regs[0].pc, 7);
        assert_eq!(regs[1].fp, 0);
    }
}
