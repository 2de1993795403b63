//! `TraceMonitor`: decides whether a hot loop edge should be interpreted,
//! recorded, or dispatched into an already-compiled fragment.
//!
//! The fragment cache is direct-mapped by bytecode PC (masked to the table
//! size) rather than a general hash map, mirroring the historical
//! implementation's per-PC single-slot cache; collisions simply evict the
//! previous fragment's cache entry, not its arena slot.

use rustc_hash::FxHashMap;

use crate::fragment::{Fragment, FragmentArena, FragmentId, TypeMap};
use crate::oracle::TypeOracle;

/// Number of direct-mapped slots in the per-PC fragment cache. A power of
/// two so the mask is cheap.
const CACHE_SLOTS: usize = 4096;
const CACHE_MASK: usize = CACHE_SLOTS - 1;

/// How many times a loop edge must be hit before recording starts.
pub const DEFAULT_HOT_THRESHOLD: u32 = 2;

/// What the monitor tells the interpreter to do at a loop edge or method
/// entry it was consulted about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    /// Stay in the interpreter; this edge isn't hot enough yet.
    Interpret,
    /// Begin recording a new fragment rooted at this PC.
    StartRecording,
    /// A recording is already in progress; keep recording through this
    /// opcode.
    ContinueRecording,
    /// A finished fragment exists for this PC and type state; run it.
    ExecuteFragment(FragmentId),
}

/// Whether a loop-edge PC currently has a recording in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordingState {
    fragment_entry_pc: usize,
}

/// The trace tier's top-level decision point and fragment cache.
pub struct TraceMonitor {
    arena: FragmentArena,
    /// Direct-mapped cache: PC-masked slot -> fragment id, last writer wins.
    cache: Vec<Option<FragmentId>>,
    hit_counts: FxHashMap<usize, u32>,
    hot_threshold: u32,
    recording: Option<RecordingState>,
    fragments_compiled: u64,
    fragments_aborted: u64,
}

impl TraceMonitor {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_HOT_THRESHOLD)
    }

    pub fn with_threshold(hot_threshold: u32) -> Self {
        TraceMonitor {
            arena: FragmentArena::new(),
            cache: vec![None; CACHE_SLOTS],
            hit_counts: FxHashMap::default(),
            hot_threshold,
            recording: None,
            fragments_compiled: 0,
            fragments_aborted: 0,
        }
    }

    fn slot(pc: usize) -> usize {
        pc & CACHE_MASK
    }

    /// A matching fragment only counts if its entry type map agrees with
    /// `observed`, since the cache slot may hold a fragment recorded under
    /// different live types for the same PC.
    fn lookup(&self, pc: usize, observed: &TypeMap) -> Option<FragmentId> {
        let id = self.cache[Self::slot(pc)]?;
        let fragment = self.arena.get(id)?;
        if fragment.blacklisted || fragment.entry_pc != pc {
            return None;
        }
        if &fragment.entry_type_map != observed {
            return None;
        }
        Some(id)
    }

    /// Called by the interpreter at a loop-back edge with the PC and the
    /// live type state it currently observes.
    pub fn on_loop_edge(&mut self, pc: usize, observed_types: &TypeMap) -> MonitorAction {
        if self.recording.is_some() {
            return MonitorAction::ContinueRecording;
        }
        if let Some(id) = self.lookup(pc, observed_types) {
            return MonitorAction::ExecuteFragment(id);
        }
        let count = self.hit_counts.entry(pc).or_insert(0);
        *count += 1;
        if *count >= self.hot_threshold {
            self.recording = Some(RecordingState { fragment_entry_pc: pc });
            MonitorAction::StartRecording
        } else {
            MonitorAction::Interpret
        }
    }

    /// A recording attempt finished successfully: install the fragment,
    /// reset the hit counter, and clear recording-in-flight state.
    pub fn finish_recording(&mut self, fragment: Fragment, ops_len: usize) -> FragmentId {
        debug_assert!(self.recording.is_some(), "finish_recording without a prior start");
        let pc = fragment.entry_pc;
        let id = self.arena.insert(fragment);
        self.cache[Self::slot(pc)] = Some(id);
        self.hit_counts.remove(&pc);
        self.recording = None;
        self.fragments_compiled += 1;
        let _ = ops_len; // IR length retained by the caller for lowering; not tracked here.
        id
    }

    /// A recording attempt was abandoned. Note the abort against the
    /// fragment's budget (if one already exists at this PC) or simply drop
    /// the in-flight state so a future hit can retry from scratch.
    pub fn abort_recording(&mut self, pc: usize) {
        self.recording = None;
        self.fragments_aborted += 1;
        if let Some(id) = self.cache[Self::slot(pc)] {
            if let Some(fragment) = self.arena.get_mut(id) {
                fragment.note_abort();
            }
        }
        self.hit_counts.remove(&pc);
    }

    /// A guard inside `fragment` just fired; bump its hit count and, once
    /// past the extension threshold, report that the caller should
    /// consider recording a branch off this exit.
    pub fn on_guard_exit(&mut self, fragment: FragmentId, exit_index: usize, extension_threshold: u32) -> bool {
        if let Some(fragment) = self.arena.get_mut(fragment) {
            if let Some(exit) = fragment.exits.get_mut(exit_index) {
                exit.hit_count += 1;
                return exit.hit_count >= extension_threshold && exit.linked_child.is_none();
            }
        }
        false
    }

    pub fn arena(&self) -> &FragmentArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut FragmentArena {
        &mut self.arena
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn fragments_compiled(&self) -> u64 {
        self.fragments_compiled
    }

    pub fn fragments_aborted(&self) -> u64 {
        self.fragments_aborted
    }

    /// Global flush: drop every fragment, every cache slot, every counter,
    /// and the shared oracle's hints.
    pub fn flush_all(&mut self, oracle: &TypeOracle) {
        self.arena.clear();
        for slot in &mut self.cache {
            *slot = None;
        }
        self.hit_counts.clear();
        self.recording = None;
        oracle.flush();
    }
}

impl Default for TraceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::SlotKey;
    use jitrt_vm::value::Tag;

    fn type_map_int(slots: &[u32]) -> TypeMap {
        let mut map = TypeMap::new();
        for &s in slots {
            map.set(SlotKey::Local(s), Tag::Int);
        }
        map
    }

    #[test]
    fn cold_loop_edge_stays_interpreted_until_threshold() {
        let mut monitor = TraceMonitor::with_threshold(2);
        let types = type_map_int(&[0]);
        assert_eq!(monitor.on_loop_edge(10, &types), MonitorAction::Interpret);
        assert_eq!(monitor.on_loop_edge(10, &types), MonitorAction::StartRecording);
    }

    #[test]
    fn finished_fragment_is_executed_on_next_matching_hit() {
        let mut monitor = TraceMonitor::with_threshold(1);
        let types = type_map_int(&[0]);
        assert_eq!(monitor.on_loop_edge(10, &types), MonitorAction::StartRecording);
        let fragment = Fragment::new_root(10, types.clone());
        let id = monitor.finish_recording(fragment, 0);
        assert_eq!(monitor.on_loop_edge(10, &types), MonitorAction::ExecuteFragment(id));
    }

    #[test]
    fn mismatched_observed_types_do_not_hit_cached_fragment() {
        let mut monitor = TraceMonitor::with_threshold(1);
        let int_types = type_map_int(&[0]);
        monitor.on_loop_edge(10, &int_types);
        let fragment = Fragment::new_root(10, int_types.clone());
        monitor.finish_recording(fragment, 0);

        let mut double_types = TypeMap::new();
        double_types.set(SlotKey::Local(0), Tag::Double);
        assert_eq!(monitor.on_loop_edge(10, &double_types), MonitorAction::StartRecording);
    }

    #[test]
    fn abort_recording_clears_in_flight_state_and_counts_toward_blacklist() {
        let mut monitor = TraceMonitor::with_threshold(1);
        let types = type_map_int(&[0]);
        monitor.on_loop_edge(10, &types);
        assert!(monitor.is_recording());
        monitor.abort_recording(10);
        assert!(!monitor.is_recording());
        assert_eq!(monitor.fragments_aborted(), 1);
    }

    #[test]
    fn flush_all_drops_fragments_and_resets_oracle() {
        let oracle = TypeOracle::new();
        let mut monitor = TraceMonitor::with_threshold(1);
        let types = type_map_int(&[0]);
        monitor.on_loop_edge(10, &types);
        let fragment = Fragment::new_root(10, types.clone());
        let id = monitor.finish_recording(fragment, 0);
        oracle.mark(crate::oracle::OracleKind::StackSlot, crate::oracle::OracleKey { script_id: 0, pc_offset: 0, slot_index: 0 });

        monitor.flush_all(&oracle);
        assert!(monitor.arena().get(id).is_none());
        assert!(!oracle.is_marked(crate::oracle::OracleKind::StackSlot, crate::oracle::OracleKey { script_id: 0, pc_offset: 0, slot_index: 0 }));
    }
}
