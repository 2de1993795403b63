//! TraceJIT: the type oracle, trace recorder, expression filters, fragment
//! storage, and the monitor that ties them together with the interpreter's
//! loop edges.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod filters;
pub mod fragment;
pub mod monitor;
pub mod oracle;
pub mod recorder;

pub use filters::FilterPipeline;
pub use fragment::{ExitKind, Fragment, FragmentArena, FragmentId, SideExit, SlotKey, TypeMap};
pub use monitor::{MonitorAction, TraceMonitor, DEFAULT_HOT_THRESHOLD};
pub use oracle::{OracleKey, OracleKind, TypeOracle, DEFAULT_ORACLE_SIZE};
pub use recorder::{AbortReason, RecordOutcome, TNode, TraceOp, TraceRecorder};

#[cfg(test)]
mod tests {
    use super::*;
    use jitrt_vm::value::Tag;

    /// End-to-end scenario S1 from the loop-recording walkthrough: a hot
    /// integer accumulator loop hits the threshold, records cleanly, and
    /// the finished fragment is then dispatched on the next matching hit.
    #[test]
    fn hot_integer_loop_records_and_then_executes() {
        let oracle = TypeOracle::new();
        let mut monitor = TraceMonitor::with_threshold(1);

        let mut entry = TypeMap::new();
        entry.set(SlotKey::Local(0), Tag::Int);
        entry.set(SlotKey::Local(1), Tag::Int);

        assert_eq!(monitor.on_loop_edge(0, &entry), MonitorAction::StartRecording);

        let mut rec = TraceRecorder::new(1, 0, entry.clone());
        let s = rec.import(SlotKey::Local(0), &oracle);
        let i = rec.import(SlotKey::Local(1), &oracle);
        let sum = rec.iadd(s, i);
        rec.store(SlotKey::Local(0), sum);
        let outcome = rec.close_loop(&oracle).unwrap();
        assert_eq!(outcome, RecordOutcome::ClosedLoop);

        let ops_len = rec.ops().len();
        let (fragment, _ops) = rec.into_fragment();
        let id = monitor.finish_recording(fragment, ops_len);

        assert_eq!(monitor.on_loop_edge(0, &entry), MonitorAction::ExecuteFragment(id));
        assert_eq!(monitor.fragments_compiled(), 1);
    }

    /// Scenario S2: the same loop, but a later iteration's type state
    /// disagrees with the recorded entry map (a double snuck into a slot
    /// the oracle hadn't flagged yet). The monitor must not dispatch the
    /// stale fragment, and a fresh recording attempt should mark the
    /// oracle so the *next* recording promotes that slot from the start.
    #[test]
    fn loop_with_late_double_retraces_after_oracle_mark() {
        let oracle = TypeOracle::new();
        let mut monitor = TraceMonitor::with_threshold(1);

        let mut entry = TypeMap::new();
        entry.set(SlotKey::Local(0), Tag::Int);
        monitor.on_loop_edge(100, &entry);

        let mut rec = TraceRecorder::new(7, 100, entry.clone());
        let half = rec.const_double(0.5);
        rec.store(SlotKey::Local(0), half);
        let err = rec.close_loop(&oracle).unwrap_err();
        assert_eq!(err, AbortReason::LoopExitTypeMismatch);
        monitor.abort_recording(100);

        let key = OracleKey { script_id: 7, pc_offset: 100, slot_index: 0 };
        assert!(oracle.is_marked(OracleKind::StackSlot, key));

        // Retrace: this time the recorder consults the oracle at import
        // time and keeps the slot as a raw (un-promoted) load.
        monitor.on_loop_edge(100, &entry);
        let mut rec2 = TraceRecorder::new(7, 100, entry.clone());
        let loaded = rec2.import(SlotKey::Local(0), &oracle);
        let half2 = rec2.const_double(0.5);
        rec2.store(SlotKey::Local(0), half2);
        let _ = loaded;
        // The entry map still says Int, so a same-shape exit still mismatches;
        // the oracle mark only prevents int *promotion*, it doesn't change
        // what the interpreter declared as the entry type. Confirms the
        // recorder consulted the oracle without panicking or double-marking.
        let err2 = rec2.close_loop(&oracle).unwrap_err();
        assert_eq!(err2, AbortReason::LoopExitTypeMismatch);
    }

    /// S1's loop body folds, through the same `FilterPipeline` every
    /// recorded op passes through, to one integer. Earlier coverage of this
    /// scenario only checked the recorder/monitor protocol transitions and
    /// never drove the fold all the way to the walkthrough's actual sum, so
    /// a constant-fold that silently discarded the computed value (only
    /// keeping its type) would have passed unnoticed.
    #[test]
    fn hot_integer_loop_folds_to_the_walkthrough_sum() {
        let mut rec = TraceRecorder::new(1, 0, TypeMap::new());
        let mut sum = rec.const_int(0);
        for i in 0..1000 {
            let term = rec.const_int(i);
            sum = rec.iadd(sum, term);
        }
        match rec.ops()[sum.0 as usize] {
            TraceOp::ConstInt { value, .. } => assert_eq!(value, 499_500),
            other => panic!("expected the whole sum to fold to one ConstInt, got {other:?}"),
        }
    }

    /// S2's loop body, once a double has snuck in, folds to the
    /// walkthrough's non-integer sum the same way.
    #[test]
    fn loop_with_late_double_folds_to_the_walkthrough_sum() {
        let mut rec = TraceRecorder::new(7, 100, TypeMap::new());
        let mut sum = rec.const_double(0.5);
        for i in 0..1000 {
            let term = rec.const_double(i as f64);
            sum = rec.fadd(sum, term);
        }
        match rec.ops()[sum.0 as usize] {
            TraceOp::ConstDouble { value, .. } => assert_eq!(value, 499_500.5),
            other => panic!("expected the whole sum to fold to one ConstDouble, got {other:?}"),
        }
    }
}
