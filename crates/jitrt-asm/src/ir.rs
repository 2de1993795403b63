//! The assembler-level IR both tiers emit into: linear pseudo-instructions
//! over virtual registers, plus `Label`/`Jump` bookkeeping for control flow
//! that isn't known until the whole stream has been emitted.
//!
//! Neither tier hand-writes machine code. They push pseudo-ops onto an
//! [`AsmBuffer`] and bind/patch [`Label`]s as bytecode is walked; a
//! [`crate::backend::CodegenBackend`] lowers the finished buffer to real
//! instructions.

use rustc_hash::FxHashMap;

/// A virtual register. Backends are free to allocate these to machine
/// registers or spill slots; nothing above the backend boundary assumes
/// either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u32);

/// An unbound branch/jump target. Created with [`AsmBuffer::new_label`] and
/// resolved with [`AsmBuffer::bind_label`]; referencing an unbound label in
/// emitted code is legal (forward branches) and resolved at link time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// A comparison condition for `Branch`/`Compare` pseudo-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Equal,
    NotEqual,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Overflow,
    NoOverflow,
}

/// An operand to a pseudo-instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Reg(Reg),
    ImmI32(i32),
    ImmI64(i64),
    ImmF64(f64),
    /// `[base + offset]`, used for loads/stores against frame slots and
    /// object payloads alike.
    Mem { base: Reg, offset: i32 },
}

/// A call target. Runtime helpers and other jitted functions are resolved
/// by a `SymbolResolver` at `finalize` time; `Address` is used for already-
/// known addresses (e.g. a specific fragment's entry point).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    RuntimeHelper(RuntimeHelper),
    Fragment(u32),
    Address(usize),
}

/// Well-known runtime helpers the generated code may call into: allocation,
/// boxing/unboxing slow paths, safepoint polls, and the two interpoline
/// trampolines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeHelper {
    AllocString,
    AllocObject,
    BoxDouble,
    UnboxSlow,
    SafepointPoll,
    InterpolineStub,
    InterpolineScripted,
    Deoptimize,
    ThrowException,
}

/// One pseudo-instruction in the linear emission stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AsmOp {
    Move { dest: Reg, src: Operand },
    Load { dest: Reg, addr: Operand },
    Store { addr: Operand, value: Operand },
    IAdd { dest: Reg, lhs: Operand, rhs: Operand },
    ISub { dest: Reg, lhs: Operand, rhs: Operand },
    IMul { dest: Reg, lhs: Operand, rhs: Operand },
    FAdd { dest: Reg, lhs: Operand, rhs: Operand },
    FSub { dest: Reg, lhs: Operand, rhs: Operand },
    FMul { dest: Reg, lhs: Operand, rhs: Operand },
    FDiv { dest: Reg, lhs: Operand, rhs: Operand },
    Compare { lhs: Operand, rhs: Operand, cond: Condition },
    /// Branch to `target` if the most recently emitted `Compare` matched
    /// `cond`; falls through otherwise.
    Branch { cond: Condition, target: Label },
    Jump { target: Label },
    Call { target: CallTarget, args: Vec<Operand>, dest: Option<Reg> },
    Return { value: Option<Operand> },
    /// Marks a point the GC must be able to find live pointers at; the
    /// backend records register/stack locations for everything still live
    /// here into the resulting `StackMapEntry` list.
    Safepoint,
}

/// The emission surface both tiers push pseudo-ops onto. Labels may be
/// referenced by a branch/jump before they are bound (forward references);
/// [`AsmBuffer::finish`] only requires that every label used is eventually
/// bound.
#[derive(Debug, Default)]
pub struct AsmBuffer {
    ops: Vec<AsmOp>,
    next_reg: u32,
    next_label: u32,
    /// label -> op index it was bound at, once known.
    bindings: FxHashMap<Label, usize>,
}

impl AsmBuffer {
    pub fn new() -> Self {
        AsmBuffer::default()
    }

    pub fn new_reg(&mut self) -> Reg {
        let r = Reg(self.next_reg);
        self.next_reg += 1;
        r
    }

    pub fn new_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    /// Bind `label` to the next op about to be emitted.
    pub fn bind_label(&mut self, label: Label) {
        self.bindings.insert(label, self.ops.len());
    }

    pub fn push(&mut self, op: AsmOp) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Finish emission, asserting every label referenced by a branch or
    /// jump was bound somewhere in the stream.
    pub fn finish(self) -> Result<AsmFunction, UnboundLabelError> {
        for op in &self.ops {
            let referenced = match op {
                AsmOp::Branch { target, .. } | AsmOp::Jump { target } => Some(*target),
                _ => None,
            };
            if let Some(label) = referenced {
                if !self.bindings.contains_key(&label) {
                    return Err(UnboundLabelError(label));
                }
            }
        }
        Ok(AsmFunction { ops: self.ops, bindings: self.bindings, reg_count: self.next_reg })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("label {0:?} referenced by a branch/jump but never bound")]
pub struct UnboundLabelError(pub Label);

/// A finished, fully-bound pseudo-instruction stream ready to hand to a
/// [`crate::backend::CodegenBackend`].
#[derive(Debug, Clone)]
pub struct AsmFunction {
    pub ops: Vec<AsmOp>,
    pub bindings: FxHashMap<Label, usize>,
    pub reg_count: u32,
}

impl AsmFunction {
    pub fn op_index_of(&self, label: Label) -> Option<usize> {
        self.bindings.get(&label).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_branch_resolves_after_bind() {
        let mut buf = AsmBuffer::new();
        let r0 = buf.new_reg();
        let done = buf.new_label();
        buf.push(AsmOp::Compare { lhs: Operand::Reg(r0), rhs: Operand::ImmI32(0), cond: Condition::Equal });
        buf.push(AsmOp::Branch { cond: Condition::Equal, target: done });
        buf.push(AsmOp::Move { dest: r0, src: Operand::ImmI32(1) });
        buf.bind_label(done);
        buf.push(AsmOp::Return { value: Some(Operand::Reg(r0)) });

        let func = buf.finish().unwrap();
        assert_eq!(func.op_index_of(done), Some(3));
    }

    #[test]
    fn unbound_label_is_rejected() {
        let mut buf = AsmBuffer::new();
        let stray = buf.new_label();
        buf.push(AsmOp::Jump { target: stray });
        assert!(buf.finish().is_err());
    }
}
