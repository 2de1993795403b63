//! `TraceFragment`, `GuardRecord`/`SideExit`, and the fragment arena.
//!
//! Fragments form cyclic graphs (a branch points back at its tree's root;
//! the root's notify list points at every outer tree that called into it).
//! Per the source patterns in `DESIGN.md`, these are modeled as indices
//! into a single arena rather than as real pointers/`Rc` cycles.

use rustc_hash::FxHashMap;

use jitrt_asm::CacheId;
use jitrt_vm::value::Tag;

/// A live slot a type map or guard snapshot describes: either a stack slot
/// relative to trace entry, or a global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKey {
    Local(u32),
    Global(u32),
}

/// The expected (or observed) interpreter tag of every live slot, at trace
/// entry or at a specific guard/loop-edge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeMap {
    pub entries: FxHashMap<SlotKey, Tag>,
}

impl TypeMap {
    pub fn new() -> Self {
        TypeMap::default()
    }

    pub fn set(&mut self, slot: SlotKey, tag: Tag) {
        self.entries.insert(slot, tag);
    }

    pub fn get(&self, slot: SlotKey) -> Option<Tag> {
        self.entries.get(&slot).copied()
    }

    /// Slots present in `self` but absent or differently-typed in `other`.
    pub fn mismatches(&self, other: &TypeMap) -> Vec<SlotKey> {
        self.entries
            .iter()
            .filter(|(slot, tag)| other.entries.get(slot) != Some(*tag))
            .map(|(slot, _)| *slot)
            .collect()
    }
}

/// Why a guard or the whole trace exited back to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Branch,
    Loop,
    Overflow,
    OutOfMemory,
    TypeMismatch,
}

/// Opaque index of a fragment in a `FragmentArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentId(pub u32);

/// The package of information recorded at a guard: what kind of exit it
/// is, the sp/pc/rp deltas needed to reconstruct interpreter state, the
/// expected type map at the exit point, and (once discovered hot) the
/// fragment the guard has been linked to.
#[derive(Debug, Clone)]
pub struct SideExit {
    pub kind: ExitKind,
    /// Bytecode PC to resume the interpreter at.
    pub exit_pc: usize,
    /// Stack-pointer delta (in slots) relative to trace entry.
    pub sp_delta: i32,
    /// Scope/"rp" (return-pointer-equivalent) delta, for nested-call
    /// bookkeeping the Recompiler also consults.
    pub rp_delta: i32,
    pub type_map: TypeMap,
    /// How many times this guard has actually fired at runtime.
    pub hit_count: u32,
    /// The fragment this guard has been patched to jump to directly,
    /// once `hit_count` crosses the extension threshold.
    pub linked_child: Option<FragmentId>,
}

impl SideExit {
    pub fn new(kind: ExitKind, exit_pc: usize, sp_delta: i32, rp_delta: i32, type_map: TypeMap) -> Self {
        SideExit { kind, exit_pc, sp_delta, rp_delta, type_map, hit_count: 0, linked_child: None }
    }
}

/// A unit of trace-compiled native code: a root fragment, or a branch
/// fragment hanging off one.
pub struct Fragment {
    pub entry_pc: usize,
    pub entry_type_map: TypeMap,
    /// Set once the fragment has been compiled and placed in the code
    /// cache; `None` while only recorded IR exists.
    pub code: Option<CacheId>,
    pub exits: Vec<SideExit>,
    /// `None` if this fragment is itself a tree root.
    pub root: Option<FragmentId>,
    /// Other trees that called into this one via `call_tree` and must be
    /// told if this tree's globals expand (`mergeGlobalsFromInnerTree`).
    pub notify_on_global_growth: Vec<FragmentId>,
    /// Saturating counter decremented on every aborted record-attempt at
    /// this fragment's entry PC; once it hits zero the PC is blacklisted
    /// and no further recording is offered here.
    pub abort_budget: u8,
    pub blacklisted: bool,
}

impl Fragment {
    pub const DEFAULT_ABORT_BUDGET: u8 = 3;

    pub fn new_root(entry_pc: usize, entry_type_map: TypeMap) -> Self {
        Fragment {
            entry_pc,
            entry_type_map,
            code: None,
            exits: Vec::new(),
            root: None,
            notify_on_global_growth: Vec::new(),
            abort_budget: Self::DEFAULT_ABORT_BUDGET,
            blacklisted: false,
        }
    }

    pub fn new_branch(entry_pc: usize, entry_type_map: TypeMap, root: FragmentId) -> Self {
        Fragment { root: Some(root), ..Fragment::new_root(entry_pc, entry_type_map) }
    }

    pub fn is_root(&self) -> bool {
        self.root.is_none()
    }

    /// Decrement the abort budget; returns `true` once exhausted (the PC
    /// should stop being offered to the recorder).
    pub fn note_abort(&mut self) -> bool {
        self.abort_budget = self.abort_budget.saturating_sub(1);
        if self.abort_budget == 0 {
            self.blacklisted = true;
        }
        self.blacklisted
    }
}

/// Arena owning every fragment in a compartment. Cross-references
/// (root/branch/notify links) are `FragmentId`s into this table, never raw
/// pointers, so the graph can be cyclic without `Rc`/`Weak` bookkeeping.
#[derive(Default)]
pub struct FragmentArena {
    fragments: Vec<Option<Fragment>>,
}

impl FragmentArena {
    pub fn new() -> Self {
        FragmentArena::default()
    }

    pub fn insert(&mut self, fragment: Fragment) -> FragmentId {
        self.fragments.push(Some(fragment));
        FragmentId((self.fragments.len() - 1) as u32)
    }

    pub fn get(&self, id: FragmentId) -> Option<&Fragment> {
        self.fragments.get(id.0 as usize).and_then(|f| f.as_ref())
    }

    pub fn get_mut(&mut self, id: FragmentId) -> Option<&mut Fragment> {
        self.fragments.get_mut(id.0 as usize).and_then(|f| f.as_mut())
    }

    /// Remove (trash) a single fragment. Any dangling references to it
    /// elsewhere in the arena become `None` lookups, which callers must
    /// treat as "no longer linked" rather than dereferencing.
    pub fn remove(&mut self, id: FragmentId) -> Option<Fragment> {
        self.fragments.get_mut(id.0 as usize).and_then(|slot| slot.take())
    }

    /// Drop every fragment. Used by a global cache flush.
    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    pub fn len(&self) -> usize {
        self.fragments.iter().filter(|f| f.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate every resident fragment with its id, in arena order. Used by
    /// a global flush to release each fragment's code-cache entry before the
    /// arena itself is cleared.
    pub fn iter(&self) -> impl Iterator<Item = (FragmentId, &Fragment)> {
        self.fragments
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|f| (FragmentId(i as u32), f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_map_mismatches_reports_changed_slots() {
        let mut a = TypeMap::new();
        a.set(SlotKey::Local(0), Tag::Int);
        a.set(SlotKey::Local(1), Tag::Double);

        let mut b = TypeMap::new();
        b.set(SlotKey::Local(0), Tag::Int);
        b.set(SlotKey::Local(1), Tag::Int);

        let mismatches = a.mismatches(&b);
        assert_eq!(mismatches, vec![SlotKey::Local(1)]);
    }

    #[test]
    fn abort_budget_blacklists_after_repeated_aborts() {
        let mut f = Fragment::new_root(10, TypeMap::new());
        assert!(!f.note_abort());
        assert!(!f.note_abort());
        assert!(f.note_abort());
        assert!(f.blacklisted);
    }

    #[test]
    fn arena_cyclic_links_survive_removal_elsewhere() {
        let mut arena = FragmentArena::new();
        let root = arena.insert(Fragment::new_root(0, TypeMap::new()));
        let branch = arena.insert(Fragment::new_branch(5, TypeMap::new(), root));
        arena.get_mut(root).unwrap().notify_on_global_growth.push(branch);

        arena.remove(branch);
        assert!(arena.get(branch).is_none());
        // The root's notify list still names the (now-dangling) id; callers
        // must check `get` before dereferencing, which this proves works.
        assert_eq!(arena.get(root).unwrap().notify_on_global_growth, vec![branch]);
    }
}
