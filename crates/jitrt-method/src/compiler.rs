//! `MethodCompiler`: walks a script's bytecode once, driving `FrameState`
//! and emitting a fast path plus an out-of-line ("stubcc") slow path for
//! every opcode, with inline caches at property/global/call sites.
//!
//! The actual machine encoding is an external concern (the low-level
//! assembler is specified only as an interface in this workspace); what
//! this module owns is the *decision* each opcode lowers to — which
//! template, which guards, which IC — recorded as [`MethodOp`]s in two
//! parallel streams (`fast_ops`, `slow_ops`) the way `jitrt-trace`'s
//! recorder keeps its own `TraceOp` vocabulary distinct from the
//! `jitrt_asm::AsmOp` a backend ultimately lowers to.

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use jitrt_vm::bytecode::{Instruction, Opcode, PropId, ShapeId};
use jitrt_vm::value::Tag;

use crate::frame_state::FrameState;
use crate::ic::{IcKind, InlineCache, MAX_STUBS};
use crate::recompiler::{CallSite, CallSiteKind};
use jitrt_asm::ir::{Condition, Label};

/// Why `MethodCompiler::compile` gave up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("opcode {0:?} has no method-JIT lowering")]
    UnsupportedOpcode(Opcode),
    #[error("stack underflow compiling pc {0}")]
    StackUnderflow(usize),
}

/// Which of the three templates 4.8.1 describes an arithmetic op lowered
/// to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithTemplate {
    ConstantFold,
    IntegerWithOverflow,
    DoubleOnly,
}

/// Resolved operand shape the arithmetic lowering switches on.
#[derive(Debug, Clone, Copy, PartialEq)]
enum OperandKind {
    ConstInt(i32),
    ConstDouble(f64),
    KnownInt,
    KnownDouble,
    Dynamic,
}

fn operand_kind(frame: &FrameState, idx: usize) -> OperandKind {
    use crate::frame_state::{DataRemat, TypeRemat};
    match (frame.entry(idx).type_state(), frame.entry(idx).data_state()) {
        (TypeRemat::Known(Tag::Int), DataRemat::Constant(bits)) => OperandKind::ConstInt(bits as i32),
        (TypeRemat::Known(Tag::Double), DataRemat::Constant(bits)) => OperandKind::ConstDouble(f64::from_bits(bits)),
        (TypeRemat::Known(Tag::Int), _) => OperandKind::KnownInt,
        (TypeRemat::Known(Tag::Double), _) => OperandKind::KnownDouble,
        _ => OperandKind::Dynamic,
    }
}

/// The operand's value as `f64`, for operand kinds that are actually
/// compile-time constants. `None` for anything the compiler can't read a
/// value out of without emitting code.
fn as_const_f64(kind: OperandKind) -> Option<f64> {
    match kind {
        OperandKind::ConstInt(v) => Some(v as f64),
        OperandKind::ConstDouble(v) => Some(v),
        OperandKind::KnownInt | OperandKind::KnownDouble | OperandKind::Dynamic => None,
    }
}

/// One recorded fast- or slow-path action. Not machine code — the record
/// a backend would consume to finish lowering.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodOp {
    PushConstInt(i32),
    PushConstDouble(f64),
    LoadLocal(u32),
    StoreLocal(u32),
    LoadGlobal(u32, /* mic index */ usize),
    StoreGlobal(u32, usize),
    /// Fast-path integer op with an overflow branch to `ool_label`.
    IntOpOverflow { op: ArithOp, ool_label: Label },
    DoubleOp(ArithOp),
    /// `MOD`'s idiv special case: divisor-zero guard, INT_MIN/-1 guard,
    /// and the negative-zero correction branch, all folded into one
    /// record since they share the same dividend/divisor registers.
    ModIdiv { ool_label: Label },
    Neg,
    CompareFused { cond: Condition, target_pc: usize },
    Branch { cond: Condition, target_pc: usize },
    Jump { target_pc: usize },
    /// `JSOP_CALL/NEW/EVAL`: guards callee-is-function, callee-is-scripted,
    /// code-pointer-non-null, then jumps; `call_site` indexes `call_sites`.
    CallFast { call_site: usize },
    PropAccess { ic_index: usize, kind: IcKind },
    ElemAccess { kind: IcKind, dense_fast_path: bool },
    TrapCheck,
    SyncAndForget,
    Return,
    StubCall(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// The finished artifact: everything the interpreter's prolog needs to
/// jump into native code, plus the side tables the Recompiler later
/// consults.
pub struct JITScript {
    pub fast_ops: Vec<MethodOp>,
    pub slow_ops: Vec<MethodOp>,
    /// Bytecode PC -> index into `fast_ops`, sorted by PC.
    pub pc_to_native: Vec<(usize, usize)>,
    pub mics: Vec<InlineCache>,
    pub pics: Vec<InlineCache>,
    pub call_sites: Vec<CallSite>,
    pub escaping_upvars: Vec<u32>,
}

impl JITScript {
    pub fn native_offset_for_pc(&self, pc: usize) -> Option<usize> {
        self.pc_to_native.binary_search_by_key(&pc, |&(p, _)| p).ok().map(|i| self.pc_to_native[i].1)
    }
}

/// Per-compile-unit state. One `MethodCompiler` compiles exactly one
/// script; it is discarded after `finalize`.
pub struct MethodCompiler {
    frame: FrameState,
    fast_ops: Vec<MethodOp>,
    slow_ops: Vec<MethodOp>,
    jump_map: FxHashMap<usize, usize>,
    join_points: FxHashSet<usize>,
    traps: FxHashSet<usize>,
    mics: Vec<InlineCache>,
    pics: Vec<InlineCache>,
    call_sites: Vec<CallSite>,
    next_label: u32,
    /// Set by a comparison opcode so the very next `IfEq`/`IfNe` can fuse
    /// into a single compare-and-branch instead of materializing a bool.
    pending_compare: Option<Condition>,
}

impl MethodCompiler {
    pub fn new(traps: FxHashSet<usize>) -> Self {
        MethodCompiler {
            frame: FrameState::new(),
            fast_ops: Vec::new(),
            slow_ops: Vec::new(),
            jump_map: FxHashMap::default(),
            join_points: FxHashSet::default(),
            traps,
            mics: Vec::new(),
            pics: Vec::new(),
            call_sites: Vec::new(),
            next_label: 0,
            pending_compare: None,
        }
    }

    fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Pre-scan the instruction stream for branch targets so join points
    /// can be recognized when walked in order.
    pub fn prescan_join_points(instrs: &[Instruction]) -> FxHashSet<usize> {
        let mut joins = FxHashSet::default();
        for instr in instrs {
            if matches!(instr.opcode, Opcode::IfEq | Opcode::IfNe | Opcode::Goto | Opcode::LoopBackedge) {
                joins.insert(instr.operand as usize);
            }
        }
        joins
    }

    /// Compile a full instruction stream into a finished `JITScript`.
    pub fn compile(mut self, instrs: &[Instruction]) -> Result<JITScript, CompileError> {
        self.join_points = Self::prescan_join_points(instrs);
        for instr in instrs {
            self.compile_one(instr)?;
        }
        Ok(self.finalize())
    }

    fn compile_one(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        if self.join_points.contains(&instr.pc) {
            let writes = self.frame.forget_everything();
            if !writes.is_empty() {
                self.fast_ops.push(MethodOp::SyncAndForget);
            }
        }
        if self.traps.contains(&instr.pc) {
            self.fast_ops.push(MethodOp::TrapCheck);
        }
        self.jump_map.insert(instr.pc, self.fast_ops.len());

        let is_compare = matches!(instr.opcode, Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge);

        match instr.opcode {
            Opcode::Nop => {}
            Opcode::Pop => {
                self.frame.pop();
            }
            Opcode::Dup => {
                self.frame.dup();
            }
            Opcode::ConstInt => {
                self.frame.push_constant(Tag::Int, instr.operand as u32 as u64);
                self.fast_ops.push(MethodOp::PushConstInt(instr.operand as i32));
            }
            Opcode::ConstDouble => {
                let bits = instr.operand as u64;
                self.frame.push_constant(Tag::Double, bits);
                self.fast_ops.push(MethodOp::PushConstDouble(f64::from_bits(bits)));
            }
            Opcode::ConstNull => {
                self.frame.push_constant(Tag::Null, 0);
            }
            Opcode::ConstUndefined => {
                self.frame.push_constant(Tag::Undefined, 0);
            }
            Opcode::GetLocal => {
                self.frame.push_synced();
                self.fast_ops.push(MethodOp::LoadLocal(instr.operand as u32));
            }
            Opcode::SetLocal => {
                self.frame.store_local(instr.operand as usize);
                self.fast_ops.push(MethodOp::StoreLocal(instr.operand as u32));
            }
            Opcode::GetGlobal => {
                let ic_index = self.emit_mic(IcKind::CallGlobal, instr.operand as u32);
                self.frame.push_synced();
                self.fast_ops.push(MethodOp::LoadGlobal(instr.operand as u32, ic_index));
            }
            Opcode::SetGlobal => {
                let ic_index = self.emit_mic(IcKind::SetGlobal, instr.operand as u32);
                self.frame.pop();
                self.fast_ops.push(MethodOp::StoreGlobal(instr.operand as u32, ic_index));
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                self.lower_arith(instr)?;
            }
            Opcode::Mod => {
                self.lower_mod();
            }
            Opcode::Neg => {
                self.frame.pop();
                self.frame.push_synced();
                self.fast_ops.push(MethodOp::Neg);
            }
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                self.frame.popn(2);
                self.frame.push_synced();
                self.pending_compare = Some(condition_for(instr.opcode));
            }
            Opcode::IfEq | Opcode::IfNe => {
                self.frame.pop();
                let target = instr.operand as usize;
                if let Some(cond) = self.pending_compare.take() {
                    let cond = if instr.opcode == Opcode::IfNe { negate(cond) } else { cond };
                    self.fast_ops.push(MethodOp::CompareFused { cond, target_pc: target });
                } else {
                    let cond = if instr.opcode == Opcode::IfEq { Condition::Equal } else { Condition::NotEqual };
                    self.fast_ops.push(MethodOp::Branch { cond, target_pc: target });
                }
            }
            Opcode::Goto | Opcode::LoopBackedge => {
                self.fast_ops.push(MethodOp::Jump { target_pc: instr.operand as usize });
            }
            Opcode::GetProp | Opcode::CallProp | Opcode::Length => {
                let ic_index = self.emit_pic(ic_kind_for(instr.opcode), instr.operand as u32);
                self.frame.pop();
                self.frame.push_synced();
                self.fast_ops.push(MethodOp::PropAccess { ic_index, kind: ic_kind_for(instr.opcode) });
            }
            Opcode::SetProp => {
                let ic_index = self.emit_pic(IcKind::Set, instr.operand as u32);
                self.frame.popn(2);
                self.frame.push_synced();
                self.fast_ops.push(MethodOp::PropAccess { ic_index, kind: IcKind::Set });
            }
            Opcode::GetElem => {
                self.frame.popn(2);
                self.frame.push_synced();
                self.fast_ops.push(MethodOp::ElemAccess { kind: IcKind::GetElem, dense_fast_path: true });
            }
            Opcode::SetElem => {
                self.frame.popn(3);
                self.frame.push_synced();
                self.fast_ops.push(MethodOp::ElemAccess { kind: IcKind::SetElem, dense_fast_path: true });
            }
            Opcode::Call | Opcode::New | Opcode::EvalOp => {
                let argc = instr.operand as usize;
                self.frame.popn(argc + 1);
                let site_index = self.call_sites.len();
                self.call_sites.push(CallSite {
                    code_offset: self.fast_ops.len(),
                    inline_index: 0,
                    pc_offset: instr.pc as u32,
                    id: CallSiteKind::ReturnFromScripted,
                });
                self.fast_ops.push(MethodOp::CallFast { call_site: site_index });
                self.frame.push_synced();
            }
            Opcode::IterInit | Opcode::IterMore | Opcode::IterNext | Opcode::IterEnd => {
                self.fast_ops.push(MethodOp::StubCall("iterator"));
            }
            Opcode::Return | Opcode::Stop | Opcode::RetRval => {
                self.frame.forget_everything();
                self.fast_ops.push(MethodOp::Return);
            }
            Opcode::Throw => {
                self.fast_ops.push(MethodOp::StubCall("throw"));
            }
        }

        if !is_compare {
            self.pending_compare = None;
        }
        Ok(())
    }

    fn lower_arith(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        if self.frame.stack_depth() < 2 {
            return Err(CompileError::StackUnderflow(instr.pc));
        }
        let rhs = self.frame.peek(0);
        let lhs = self.frame.peek(1);
        let op = arith_op_for(instr.opcode);

        let lhs_kind = operand_kind(&self.frame, lhs);
        let rhs_kind = operand_kind(&self.frame, rhs);

        let (template, fold_result) = match (lhs_kind, rhs_kind) {
            (OperandKind::ConstInt(a), OperandKind::ConstInt(b)) => {
                let folded = match op {
                    ArithOp::Add => a.checked_add(b).map(|v| (v, false)),
                    ArithOp::Sub => a.checked_sub(b).map(|v| (v, false)),
                    ArithOp::Mul => a.checked_mul(b).map(|v| (v, false)),
                    ArithOp::Div => {
                        if b != 0 {
                            Some(((a / b), a % b != 0))
                        } else {
                            None
                        }
                    }
                };
                match folded {
                    // Exact: fold to the integer result at compile time.
                    Some((v, false)) => (ArithTemplate::ConstantFold, Some((Tag::Int, v as u32 as u64))),
                    // Overflow, div-by-zero, or an inexact division: the
                    // source ints can't be folded to a compile-time int
                    // result, so this falls through to the runtime double
                    // path like any other not-provably-int-safe pair.
                    _ => (ArithTemplate::DoubleOnly, None),
                }
            }
            // Both operands are constants and at least one is a double:
            // fold to the double result at compile time.
            (OperandKind::ConstDouble(_), OperandKind::ConstInt(_))
            | (OperandKind::ConstInt(_), OperandKind::ConstDouble(_))
            | (OperandKind::ConstDouble(_), OperandKind::ConstDouble(_)) => {
                let a = as_const_f64(lhs_kind).expect("matched arm guarantees a constant operand");
                let b = as_const_f64(rhs_kind).expect("matched arm guarantees a constant operand");
                let result = match op {
                    ArithOp::Add => a + b,
                    ArithOp::Sub => a - b,
                    ArithOp::Mul => a * b,
                    ArithOp::Div => a / b,
                };
                (ArithTemplate::ConstantFold, Some((Tag::Double, result.to_bits())))
            }
            // A constant double paired with a non-constant operand can't
            // be folded; the non-constant side only gets resolved at run
            // time.
            (OperandKind::ConstDouble(_), _) | (_, OperandKind::ConstDouble(_)) => (ArithTemplate::DoubleOnly, None),
            (OperandKind::KnownInt, OperandKind::KnownInt) | (OperandKind::KnownInt, OperandKind::ConstInt(_)) | (OperandKind::ConstInt(_), OperandKind::KnownInt) => {
                (ArithTemplate::IntegerWithOverflow, None)
            }
            (OperandKind::KnownDouble, _) | (_, OperandKind::KnownDouble) => (ArithTemplate::DoubleOnly, None),
            _ => (ArithTemplate::DoubleOnly, None),
        };

        self.frame.popn(2);
        match template {
            ArithTemplate::ConstantFold => {
                let (tag, bits) = fold_result.expect("ConstantFold template always carries a folded value");
                self.frame.push_constant(tag, bits);
                self.fast_ops.push(if tag == Tag::Int {
                    MethodOp::PushConstInt(bits as u32 as i32)
                } else {
                    MethodOp::PushConstDouble(f64::from_bits(bits))
                });
            }
            ArithTemplate::IntegerWithOverflow => {
                let ool = self.new_label();
                self.frame.push_synced();
                self.fast_ops.push(MethodOp::IntOpOverflow { op, ool_label: ool });
                self.slow_ops.push(MethodOp::DoubleOp(op));
            }
            ArithTemplate::DoubleOnly => {
                self.frame.push_synced();
                self.fast_ops.push(MethodOp::DoubleOp(op));
            }
        }
        Ok(())
    }

    /// `MOD` lowers to an integer idiv with dividend/divisor guards and a
    /// negative-zero correction: a zero remainder from a negative dividend
    /// must store a boxed `-0.0`, not an integer zero.
    fn lower_mod(&mut self) {
        self.frame.popn(2);
        let ool = self.new_label();
        self.frame.push_synced();
        self.fast_ops.push(MethodOp::ModIdiv { ool_label: ool });
        self.slow_ops.push(MethodOp::StubCall("mod_slow"));
    }

    fn emit_mic(&mut self, kind: IcKind, atom_id: u32) -> usize {
        let entry = self.new_label();
        let fast = self.new_label();
        let slow = self.new_label();
        let storeback = self.new_label();
        self.mics.push(InlineCache::new(kind, atom_id, entry, fast, slow, storeback));
        self.mics.len() - 1
    }

    fn emit_pic(&mut self, kind: IcKind, atom_id: u32) -> usize {
        let entry = self.new_label();
        let fast = self.new_label();
        let slow = self.new_label();
        let storeback = self.new_label();
        self.pics.push(InlineCache::new(kind, atom_id, entry, fast, slow, storeback));
        self.pics.len() - 1
    }

    fn finalize(self) -> JITScript {
        let mut pc_to_native: Vec<(usize, usize)> = self.jump_map.into_iter().collect();
        pc_to_native.sort_by_key(|&(pc, _)| pc);
        JITScript {
            fast_ops: self.fast_ops,
            slow_ops: self.slow_ops,
            pc_to_native,
            mics: self.mics,
            pics: self.pics,
            call_sites: self.call_sites,
            escaping_upvars: Vec::new(),
        }
    }
}

fn arith_op_for(opcode: Opcode) -> ArithOp {
    match opcode {
        Opcode::Add => ArithOp::Add,
        Opcode::Sub => ArithOp::Sub,
        Opcode::Mul => ArithOp::Mul,
        Opcode::Div => ArithOp::Div,
        other => unreachable!("not an arithmetic opcode: {other:?}"),
    }
}

fn condition_for(opcode: Opcode) -> Condition {
    match opcode {
        Opcode::Eq => Condition::Equal,
        Opcode::Ne => Condition::NotEqual,
        Opcode::Lt => Condition::LessThan,
        Opcode::Le => Condition::LessOrEqual,
        Opcode::Gt => Condition::GreaterThan,
        Opcode::Ge => Condition::GreaterOrEqual,
        other => unreachable!("not a comparison opcode: {other:?}"),
    }
}

fn negate(cond: Condition) -> Condition {
    match cond {
        Condition::Equal => Condition::NotEqual,
        Condition::NotEqual => Condition::Equal,
        Condition::LessThan => Condition::GreaterOrEqual,
        Condition::LessOrEqual => Condition::GreaterThan,
        Condition::GreaterThan => Condition::LessOrEqual,
        Condition::GreaterOrEqual => Condition::LessThan,
        Condition::Overflow => Condition::NoOverflow,
        Condition::NoOverflow => Condition::Overflow,
    }
}

fn ic_kind_for(opcode: Opcode) -> IcKind {
    match opcode {
        Opcode::GetProp => IcKind::Get,
        Opcode::CallProp => IcKind::Call,
        Opcode::Length => IcKind::Length,
        other => unreachable!("not a property-reading opcode: {other:?}"),
    }
}
