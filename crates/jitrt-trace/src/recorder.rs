//! `TraceRecorder`: per-opcode recording, guards, snapshots.
//!
//! Owns the fragment under construction, a node buffer (the "lir"), a
//! tracker from live slots to the node currently representing their value,
//! the current call depth, the entry type map, and a reference to the
//! shared [`crate::oracle::TypeOracle`].

use rustc_hash::FxHashMap;

use jitrt_vm::value::Tag;

use crate::filters::FilterPipeline;
use crate::fragment::{ExitKind, Fragment, SideExit, SlotKey, TypeMap};
use crate::oracle::{OracleKey, OracleKind, TypeOracle};

/// Index of a node in a `TraceRecorder`'s buffer — the trace-local "IR
/// instruction" identity the tracker maps slots onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TNode(pub u32);

/// The recorder's node vocabulary. Distinct from `jitrt_asm::AsmOp`: this
/// is a typed, numeric-value-oriented IR that still talks about boxed
/// interpreter tags; it is lowered to `AsmOp` only once a fragment
/// finishes recording successfully (see `crate::monitor`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TraceOp {
    ConstInt { dest: TNode, value: i32 },
    ConstDouble { dest: TNode, value: f64 },
    LoadSlot { dest: TNode, slot: SlotKey },
    StoreSlot { slot: SlotKey, value: TNode },
    /// Convert an int node to double, so subsequent arithmetic sees a
    /// uniform numeric representation. Pattern-matched away by the
    /// `FuncFilter` wherever a demotion applies.
    I2F { dest: TNode, src: TNode },
    IAdd { dest: TNode, lhs: TNode, rhs: TNode },
    ISub { dest: TNode, lhs: TNode, rhs: TNode },
    IMul { dest: TNode, lhs: TNode, rhs: TNode },
    INeg { dest: TNode, src: TNode },
    FAdd { dest: TNode, lhs: TNode, rhs: TNode },
    FSub { dest: TNode, lhs: TNode, rhs: TNode },
    FMul { dest: TNode, lhs: TNode, rhs: TNode },
    FDiv { dest: TNode, lhs: TNode, rhs: TNode },
    FNeg { dest: TNode, src: TNode },
    /// A guard: if the condition the recorder just computed does not hold,
    /// the trace must side-exit to `exit`. `exit` indexes `Fragment::exits`
    /// once the fragment is finalized; while recording it indexes a local
    /// `Vec<SideExit>` the recorder owns.
    Guard { cond: TNode, exit: u32 },
    /// Marks the loop-closing edge; emitted once by `close_loop`.
    LoopEdge { exit: u32 },
}

/// What a per-opcode recording handler (or `close_loop`) reports back to
/// the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Keep recording; nothing terminal happened.
    Continue,
    /// The loop back-edge closed successfully; the fragment is ready to be
    /// finalized by the `TraceMonitor`.
    ClosedLoop,
}

/// Why a recording attempt was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    UnsupportedOpcode,
    ExceptionRaised,
    CallDepthExceeded,
    TooManyArgsToSpill,
    LoopExitTypeMismatch,
}

const MAX_CALL_DEPTH: u32 = 8;

/// A single recording session, building one fragment's IR.
pub struct TraceRecorder {
    entry_pc: usize,
    entry_type_map: TypeMap,
    buf: Vec<TraceOp>,
    filters: FilterPipeline,
    /// Maps each live slot to the node currently holding its value.
    tracker: FxHashMap<SlotKey, TNode>,
    call_depth: u32,
    exits: Vec<SideExit>,
    script_id: u32,
}

impl TraceRecorder {
    pub fn new(script_id: u32, entry_pc: usize, entry_type_map: TypeMap) -> Self {
        TraceRecorder {
            entry_pc,
            entry_type_map,
            buf: Vec::new(),
            filters: FilterPipeline::new(),
            tracker: FxHashMap::default(),
            call_depth: 0,
            exits: Vec::new(),
            script_id,
        }
    }

    pub fn entry_pc(&self) -> usize {
        self.entry_pc
    }

    fn emit(&mut self, op: TraceOp) -> TNode {
        self.filters.emit(&mut self.buf, op)
    }

    fn next_node(&self) -> TNode {
        TNode(self.buf.len() as u32)
    }

    /// First touch of a slot: load from the native frame, promoting ints to
    /// double unless the Oracle says the slot must stay int.
    pub fn import(&mut self, slot: SlotKey, oracle: &TypeOracle) -> TNode {
        if let Some(&node) = self.tracker.get(&slot) {
            return node;
        }
        let dest = self.next_node();
        let raw = self.emit(TraceOp::LoadSlot { dest, slot });
        let tag = self.entry_type_map.get(slot).unwrap_or(Tag::Int);
        let node = if tag == Tag::Int && !self.demotion_forbidden(slot, oracle) {
            let dest = self.next_node();
            self.emit(TraceOp::I2F { dest, src: raw })
        } else {
            raw
        };
        self.tracker.insert(slot, node);
        node
    }

    fn demotion_forbidden(&self, slot: SlotKey, oracle: &TypeOracle) -> bool {
        let kind = match slot {
            SlotKey::Local(_) => OracleKind::StackSlot,
            SlotKey::Global(_) => OracleKind::GlobalSlot,
        };
        let key = OracleKey { script_id: self.script_id, pc_offset: self.entry_pc as u32, slot_index: slot_index(slot) };
        oracle.is_marked(kind, key)
    }

    pub fn store(&mut self, slot: SlotKey, value: TNode) {
        self.emit(TraceOp::StoreSlot { slot, value });
        self.tracker.insert(slot, value);
    }

    pub fn const_int(&mut self, value: i32) -> TNode {
        let dest = self.next_node();
        self.emit(TraceOp::ConstInt { dest, value })
    }

    pub fn const_double(&mut self, value: f64) -> TNode {
        let dest = self.next_node();
        self.emit(TraceOp::ConstDouble { dest, value })
    }

    pub fn iadd(&mut self, lhs: TNode, rhs: TNode) -> TNode {
        let dest = self.next_node();
        self.emit(TraceOp::IAdd { dest, lhs, rhs })
    }

    pub fn isub(&mut self, lhs: TNode, rhs: TNode) -> TNode {
        let dest = self.next_node();
        self.emit(TraceOp::ISub { dest, lhs, rhs })
    }

    pub fn imul(&mut self, lhs: TNode, rhs: TNode) -> TNode {
        let dest = self.next_node();
        self.emit(TraceOp::IMul { dest, lhs, rhs })
    }

    pub fn fadd(&mut self, lhs: TNode, rhs: TNode) -> TNode {
        let dest = self.next_node();
        self.emit(TraceOp::FAdd { dest, lhs, rhs })
    }

    /// Record a guard. The snapshot's type map is computed by walking the
    /// tracker and asking, for every live slot, whether its node is a
    /// promoted int (still `Tag::Int` at the interpreter boundary), a raw
    /// double, or the static tag of a non-number value.
    pub fn guard(&mut self, cond: TNode, kind: ExitKind, exit_pc: usize, sp_delta: i32, rp_delta: i32) -> u32 {
        let type_map = self.snapshot_type_map();
        let exit = SideExit::new(kind, exit_pc, sp_delta, rp_delta, type_map);
        self.exits.push(exit);
        let exit_idx = (self.exits.len() - 1) as u32;
        self.emit(TraceOp::Guard { cond, exit: exit_idx });
        exit_idx
    }

    fn snapshot_type_map(&self) -> TypeMap {
        let mut map = TypeMap::new();
        for (&slot, &node) in &self.tracker {
            let tag = self.static_tag_of(node).unwrap_or(Tag::Double);
            map.set(slot, tag);
        }
        map
    }

    /// The interpreter-visible tag a node reboxes to: an `I2F` reboxes back
    /// to `Int`, everything else numeric reboxes to `Double`, and a fresh
    /// `LoadSlot` keeps whatever the entry type map already said.
    fn static_tag_of(&self, node: TNode) -> Option<Tag> {
        match self.buf.get(node.0 as usize)? {
            TraceOp::I2F { .. } | TraceOp::ConstInt { .. } | TraceOp::IAdd { .. } | TraceOp::ISub { .. } | TraceOp::IMul { .. } | TraceOp::INeg { .. } => {
                Some(Tag::Int)
            }
            TraceOp::ConstDouble { .. } | TraceOp::FAdd { .. } | TraceOp::FSub { .. } | TraceOp::FMul { .. } | TraceOp::FDiv { .. } | TraceOp::FNeg { .. } => {
                Some(Tag::Double)
            }
            TraceOp::LoadSlot { slot, .. } => self.entry_type_map.get(*slot),
            _ => None,
        }
    }

    /// Close the loop at `exit_pc == entry_pc`: verify the exit type map
    /// matches the entry type map. On mismatch, mark every offending slot
    /// in the oracle and report `AbortReason::LoopExitTypeMismatch` so the
    /// caller retries recording. On match, emit the loop-edge guard.
    pub fn close_loop(&mut self, oracle: &TypeOracle) -> Result<RecordOutcome, AbortReason> {
        let exit_map = self.snapshot_type_map();
        let mismatches = exit_map.mismatches(&self.entry_type_map);
        if !mismatches.is_empty() {
            for slot in mismatches {
                let kind = match slot {
                    SlotKey::Local(_) => OracleKind::StackSlot,
                    SlotKey::Global(_) => OracleKind::GlobalSlot,
                };
                let key = OracleKey { script_id: self.script_id, pc_offset: self.entry_pc as u32, slot_index: slot_index(slot) };
                oracle.mark(kind, key);
            }
            return Err(AbortReason::LoopExitTypeMismatch);
        }
        let exit = SideExit::new(ExitKind::Loop, self.entry_pc, 0, 0, exit_map);
        self.exits.push(exit);
        let exit_idx = (self.exits.len() - 1) as u32;
        self.emit(TraceOp::LoopEdge { exit: exit_idx });
        Ok(RecordOutcome::ClosedLoop)
    }

    pub fn enter_call(&mut self) -> Result<(), AbortReason> {
        self.call_depth += 1;
        if self.call_depth > MAX_CALL_DEPTH {
            return Err(AbortReason::CallDepthExceeded);
        }
        Ok(())
    }

    pub fn leave_call(&mut self) {
        self.call_depth = self.call_depth.saturating_sub(1);
    }

    /// Consume the recorder into a finished root fragment. Only called
    /// after `close_loop` returns `Ok`.
    pub fn into_fragment(self) -> (Fragment, Vec<TraceOp>) {
        let mut fragment = Fragment::new_root(self.entry_pc, self.entry_type_map);
        fragment.exits = self.exits;
        (fragment, self.buf)
    }

    pub fn ops(&self) -> &[TraceOp] {
        &self.buf
    }
}

fn slot_index(slot: SlotKey) -> u32 {
    match slot {
        SlotKey::Local(i) => i,
        SlotKey::Global(i) => i,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_s1_hot_integer_loop_closes_with_int_types() {
        // `var s=0; for (var i=0;i<1000;++i) s+=i;` — entry type map says
        // both slots are Int; the loop body only ever adds ints, so the
        // exit map must match exactly and close_loop must succeed without
        // touching the oracle.
        let oracle = TypeOracle::new();
        let mut entry = TypeMap::new();
        entry.set(SlotKey::Local(0), Tag::Int); // s
        entry.set(SlotKey::Local(1), Tag::Int); // i

        let mut rec = TraceRecorder::new(1, 0, entry);
        let s = rec.import(SlotKey::Local(0), &oracle);
        let i = rec.import(SlotKey::Local(1), &oracle);
        let sum = rec.iadd(s, i);
        rec.store(SlotKey::Local(0), sum);

        let outcome = rec.close_loop(&oracle).unwrap();
        assert_eq!(outcome, RecordOutcome::ClosedLoop);
        assert!(!oracle.is_marked(
            crate::oracle::OracleKind::StackSlot,
            OracleKey { script_id: 1, pc_offset: 0, slot_index: 0 }
        ));
    }

    #[test]
    fn scenario_s2_late_double_marks_oracle_on_mismatch() {
        // Entry type map claims `s` is Int, but the body stores a double
        // into it (the `i===500` branch added 0.5) — close_loop must
        // report a mismatch and mark the oracle for slot 0.
        let oracle = TypeOracle::new();
        let mut entry = TypeMap::new();
        entry.set(SlotKey::Local(0), Tag::Int);

        let mut rec = TraceRecorder::new(2, 0, entry);
        let half = rec.const_double(0.5);
        rec.store(SlotKey::Local(0), half);

        let err = rec.close_loop(&oracle).unwrap_err();
        assert_eq!(err, AbortReason::LoopExitTypeMismatch);
        assert!(oracle.is_marked(
            crate::oracle::OracleKind::StackSlot,
            OracleKey { script_id: 2, pc_offset: 0, slot_index: 0 }
        ));
    }

    #[test]
    fn import_reuses_tracker_entry_on_second_touch() {
        let oracle = TypeOracle::new();
        let mut entry = TypeMap::new();
        entry.set(SlotKey::Local(0), Tag::Int);
        let mut rec = TraceRecorder::new(3, 0, entry);
        let first = rec.import(SlotKey::Local(0), &oracle);
        let second = rec.import(SlotKey::Local(0), &oracle);
        assert_eq!(first, second);
    }

    #[test]
    fn call_depth_exceeding_limit_aborts() {
        let mut rec = TraceRecorder::new(4, 0, TypeMap::new());
        for _ in 0..MAX_CALL_DEPTH {
            rec.enter_call().unwrap();
        }
        assert_eq!(rec.enter_call().unwrap_err(), AbortReason::CallDepthExceeded);
    }

    #[test]
    fn guard_snapshot_records_promoted_int_as_int_tag() {
        let oracle = TypeOracle::new();
        let mut entry = TypeMap::new();
        entry.set(SlotKey::Local(0), Tag::Int);
        let mut rec = TraceRecorder::new(5, 0, entry);
        let i = rec.import(SlotKey::Local(0), &oracle);
        let zero = rec.const_int(0);
        let cond = rec.iadd(i, zero); // stand-in for a comparison result
        let exit_idx = rec.guard(cond, ExitKind::Branch, 42, -1, 0);
        let (fragment, _ops) = rec.into_fragment();
        assert_eq!(fragment.exits.len(), 1);
        assert_eq!(fragment.exits[exit_idx as usize].type_map.get(SlotKey::Local(0)), Some(Tag::Int));
    }
}
