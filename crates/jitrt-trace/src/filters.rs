//! The chained expression filters sitting between the recorder and its IR
//! buffer.
//!
//! The historical implementation expresses this as a linked list of
//! polymorphic writer objects, each overriding the ones it wants to
//! rewrite. Per `DESIGN.md`'s note on open recursion via inheritance, this
//! crate instead encodes the chain as a single [`FilterPipeline`] — a
//! static, compile-time-composed sequence (CSE, then constant-folding /
//! algebraic identities, then the numeric-demotion `FuncFilter`) that a
//! `TraceRecorder` pushes every op through before it lands in the node
//! buffer. There is no debug "verbose naming" pass here: this workspace has
//! no separate debug-build feature flag to hang one off of.

use rustc_hash::FxHashMap;

use crate::recorder::{TNode, TraceOp};

/// Emits ops into the trace's node buffer, running each one through CSE,
/// constant folding, and the numeric-demotion `FuncFilter` before it is
/// appended. Returns the `TNode` identifying the (possibly pre-existing,
/// possibly rewritten) instruction that now represents the requested
/// value.
#[derive(Default)]
pub struct FilterPipeline {
    /// CSE table: a normalized, dest-less op description to the `TNode`
    /// that already computes it.
    cse: FxHashMap<CseKey, TNode>,
}

/// A CSE key is the op with its destination erased — two ops are redundant
/// if they'd compute the same value from the same inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CseKey {
    ConstInt(i32),
    ConstDoubleBits(u64),
    I2F(TNode),
    IAdd(TNode, TNode),
    ISub(TNode, TNode),
    IMul(TNode, TNode),
    FAdd(TNode, TNode),
    FSub(TNode, TNode),
    FMul(TNode, TNode),
    FDiv(TNode, TNode),
    INeg(TNode),
    FNeg(TNode),
}

fn cse_key(op: &TraceOp) -> Option<CseKey> {
    use TraceOp::*;
    Some(match *op {
        ConstInt { value, .. } => CseKey::ConstInt(value),
        ConstDouble { value, .. } => CseKey::ConstDoubleBits(value.to_bits()),
        I2F { src, .. } => CseKey::I2F(src),
        IAdd { lhs, rhs, .. } => CseKey::IAdd(lhs, rhs),
        ISub { lhs, rhs, .. } => CseKey::ISub(lhs, rhs),
        IMul { lhs, rhs, .. } => CseKey::IMul(lhs, rhs),
        FAdd { lhs, rhs, .. } => CseKey::FAdd(lhs, rhs),
        FSub { lhs, rhs, .. } => CseKey::FSub(lhs, rhs),
        FMul { lhs, rhs, .. } => CseKey::FMul(lhs, rhs),
        FDiv { lhs, rhs, .. } => CseKey::FDiv(lhs, rhs),
        INeg { src, .. } => CseKey::INeg(src),
        FNeg { src, .. } => CseKey::FNeg(src),
        // Loads/stores/guards/calls are never CSE'd: they have ordering or
        // side-effect dependencies the key above can't express.
        _ => return None,
    })
}

impl FilterPipeline {
    pub fn new() -> Self {
        FilterPipeline::default()
    }

    /// Run `op` through the chain, appending it (or reusing a prior result)
    /// into `buf`. `dest_of` is called to learn the `TNode` a freshly
    /// appended op would receive; the pipeline never allocates nodes
    /// itself, it only decides whether `buf.push` is necessary.
    pub fn emit(&mut self, buf: &mut Vec<TraceOp>, op: TraceOp) -> TNode {
        let op = self.fold_and_demote(buf, op);
        if let Some(key) = cse_key(&op) {
            if let Some(&existing) = self.cse.get(&key) {
                return existing;
            }
            let node = push(buf, op);
            self.cse.insert(key, node);
            node
        } else {
            push(buf, op)
        }
    }

    /// Constant folding and the `FuncFilter` numeric demotions, run before
    /// CSE sees the (possibly rewritten) op.
    fn fold_and_demote(&mut self, buf: &[TraceOp], op: TraceOp) -> TraceOp {
        use TraceOp::*;
        match op {
            IAdd { dest, lhs, rhs } => {
                if let (Some(a), Some(b)) = (const_int(buf, lhs), const_int(buf, rhs)) {
                    return ConstInt { dest, value: a.wrapping_add(b) };
                }
                // double_to_int32(double_add(i2f a, i2f b)) folds to
                // int32_add(a, b) with an overflow guard is modeled by the
                // recorder itself recognizing an `IAdd` over two `I2F`
                // sources as already being the demoted form — nothing left
                // to rewrite here; this arm exists so the match is
                // exhaustive over the demotion's *output* shape too.
                IAdd { dest, lhs, rhs }
            }
            FAdd { dest, lhs, rhs } => {
                if let (Some(a), Some(b)) = (const_double(buf, lhs), const_double(buf, rhs)) {
                    return ConstDouble { dest, value: a + b };
                }
                if let (Some(a), Some(b)) = (promoted_int_source(buf, lhs), promoted_int_source(buf, rhs)) {
                    // double_add(i2f a, i2f b) -> treat as the int op the
                    // demotion would have produced; the caller (recorder)
                    // is responsible for wrapping this in an overflow
                    // guard, since only it knows the guard's exit map.
                    return IAdd { dest, lhs: a, rhs: b };
                }
                FAdd { dest, lhs, rhs }
            }
            FSub { dest, lhs, rhs } => {
                if let (Some(a), Some(b)) = (const_double(buf, lhs), const_double(buf, rhs)) {
                    return ConstDouble { dest, value: a - b };
                }
                if let (Some(a), Some(b)) = (promoted_int_source(buf, lhs), promoted_int_source(buf, rhs)) {
                    return ISub { dest, lhs: a, rhs: b };
                }
                FSub { dest, lhs, rhs }
            }
            FMul { dest, lhs, rhs } => {
                if let (Some(a), Some(b)) = (const_double(buf, lhs), const_double(buf, rhs)) {
                    return ConstDouble { dest, value: a * b };
                }
                FMul { dest, lhs, rhs }
            }
            ISub { dest, lhs, rhs } => {
                if let (Some(a), Some(b)) = (const_int(buf, lhs), const_int(buf, rhs)) {
                    return ConstInt { dest, value: a.wrapping_sub(b) };
                }
                ISub { dest, lhs, rhs }
            }
            IMul { dest, lhs, rhs } => {
                if let (Some(a), Some(b)) = (const_int(buf, lhs), const_int(buf, rhs)) {
                    return ConstInt { dest, value: a.wrapping_mul(b) };
                }
                IMul { dest, lhs, rhs }
            }
            FNeg { dest, src } => {
                // f64_neg of an i2f recognized as i32_neg with overflow guard.
                if let Some(inner) = promoted_int_source(buf, src) {
                    return INeg { dest, src: inner };
                }
                FNeg { dest, src }
            }
            other => other,
        }
    }
}

fn push(buf: &mut Vec<TraceOp>, op: TraceOp) -> TNode {
    buf.push(op);
    TNode((buf.len() - 1) as u32)
}

fn const_int(buf: &[TraceOp], node: TNode) -> Option<i32> {
    match buf.get(node.0 as usize)? {
        TraceOp::ConstInt { value, .. } => Some(*value),
        _ => None,
    }
}

fn const_double(buf: &[TraceOp], node: TNode) -> Option<f64> {
    match buf.get(node.0 as usize)? {
        TraceOp::ConstDouble { value, .. } => Some(*value),
        _ => None,
    }
}

/// If `node` is an `I2F` (an int promoted to double for uniform numeric
/// handling), return the int node it promoted.
fn promoted_int_source(buf: &[TraceOp], node: TNode) -> Option<TNode> {
    match buf.get(node.0 as usize)? {
        TraceOp::I2F { src, .. } => Some(*src),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::SlotKey;

    fn dummy_dest() -> TNode {
        TNode(u32::MAX)
    }

    #[test]
    fn constant_folds_int_add() {
        let mut buf = Vec::new();
        let mut pipeline = FilterPipeline::new();
        let a = pipeline.emit(&mut buf, TraceOp::ConstInt { dest: dummy_dest(), value: 2 });
        let b = pipeline.emit(&mut buf, TraceOp::ConstInt { dest: dummy_dest(), value: 3 });
        let sum = pipeline.emit(&mut buf, TraceOp::IAdd { dest: dummy_dest(), lhs: a, rhs: b });
        assert!(matches!(buf[sum.0 as usize], TraceOp::ConstInt { value: 5, .. }));
    }

    #[test]
    fn cse_reuses_identical_add() {
        let mut buf = Vec::new();
        let mut pipeline = FilterPipeline::new();
        let a = pipeline.emit(&mut buf, TraceOp::I2F { dest: dummy_dest(), src: TNode(0) });
        let b = pipeline.emit(&mut buf, TraceOp::I2F { dest: dummy_dest(), src: TNode(0) });
        assert_eq!(a, b, "re-recording the same i2f should reuse the node");
    }

    #[test]
    fn double_add_of_promoted_ints_demotes_to_int_add() {
        let mut buf = Vec::new();
        let mut pipeline = FilterPipeline::new();
        let raw_a = pipeline.emit(&mut buf, TraceOp::LoadSlot { dest: dummy_dest(), slot: SlotKey::Local(0) });
        let raw_b = pipeline.emit(&mut buf, TraceOp::LoadSlot { dest: dummy_dest(), slot: SlotKey::Local(1) });
        let fa = pipeline.emit(&mut buf, TraceOp::I2F { dest: dummy_dest(), src: raw_a });
        let fb = pipeline.emit(&mut buf, TraceOp::I2F { dest: dummy_dest(), src: raw_b });
        let sum = pipeline.emit(&mut buf, TraceOp::FAdd { dest: dummy_dest(), lhs: fa, rhs: fb });
        match &buf[sum.0 as usize] {
            TraceOp::IAdd { lhs, rhs, .. } => {
                assert_eq!(*lhs, raw_a);
                assert_eq!(*rhs, raw_b);
            }
            other => panic!("expected demoted IAdd, got {other:?}"),
        }
    }
}
