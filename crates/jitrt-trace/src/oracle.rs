//! `TypeOracle`: a monotonic, wait-free hint set.
//!
//! Two fixed-size bit vectors record "do not demote this stack slot from
//! double to int" and "this global slot should stay boxed". Both grow only
//! by `mark`; nothing ever clears an individual bit, only a whole-table
//! `flush`. Collisions (two distinct keys hashing to the same bit) are
//! tolerated — they just make the hint fire for a slot that never asked for
//! it, which costs performance, not correctness.

use std::sync::atomic::{AtomicU64, Ordering};

/// Default bit-vector size: a prime in the 1k-4k range, as the historical
/// implementation used, chosen to spread out `(script, pc, slot)` hashes.
pub const DEFAULT_ORACLE_SIZE: usize = 2053;

/// Which of the two bitmaps a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OracleKind {
    /// "Do not demote this stack slot to int."
    StackSlot,
    /// "This global slot should stay boxed."
    GlobalSlot,
}

/// A lookup key: which script, which bytecode offset, which slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OracleKey {
    pub script_id: u32,
    pub pc_offset: u32,
    pub slot_index: u32,
}

fn hash_key(key: OracleKey, size: usize) -> usize {
    // FNV-1a over the three fields, reduced mod the (prime) table size.
    let mut h: u64 = 0xcbf29ce484222325;
    for word in [key.script_id as u64, key.pc_offset as u64, key.slot_index as u64] {
        h ^= word;
        h = h.wrapping_mul(0x100000001b3);
    }
    (h as usize) % size
}

struct Bitmap {
    words: Vec<AtomicU64>,
    bits: usize,
}

impl Bitmap {
    fn new(bits: usize) -> Self {
        let nwords = bits.div_ceil(64);
        Bitmap { words: (0..nwords).map(|_| AtomicU64::new(0)).collect(), bits }
    }

    fn mark(&self, bit: usize) {
        let (word, shift) = (bit / 64, bit % 64);
        self.words[word].fetch_or(1 << shift, Ordering::Relaxed);
    }

    fn is_marked(&self, bit: usize) -> bool {
        let (word, shift) = (bit / 64, bit % 64);
        (self.words[word].load(Ordering::Relaxed) >> shift) & 1 != 0
    }

    fn clear(&self) {
        for w in &self.words {
            w.store(0, Ordering::Relaxed);
        }
    }
}

/// The shared, racy-write-tolerant hint table both `TraceRecorder` and
/// `TraceMonitor` consult.
pub struct TypeOracle {
    stack_bits: Bitmap,
    global_bits: Bitmap,
    size: usize,
}

impl TypeOracle {
    pub fn new() -> Self {
        Self::with_size(DEFAULT_ORACLE_SIZE)
    }

    pub fn with_size(size: usize) -> Self {
        TypeOracle { stack_bits: Bitmap::new(size), global_bits: Bitmap::new(size), size }
    }

    /// Idempotent: set the bit for `key` in the bitmap named by `kind`.
    pub fn mark(&self, kind: OracleKind, key: OracleKey) {
        let bit = hash_key(key, self.size);
        match kind {
            OracleKind::StackSlot => self.stack_bits.mark(bit),
            OracleKind::GlobalSlot => self.global_bits.mark(bit),
        }
    }

    /// True once `mark` has been called for `key` (or a colliding key) in
    /// that bitmap, until the next `flush`.
    pub fn is_marked(&self, kind: OracleKind, key: OracleKey) -> bool {
        let bit = hash_key(key, self.size);
        match kind {
            OracleKind::StackSlot => self.stack_bits.is_marked(bit),
            OracleKind::GlobalSlot => self.global_bits.is_marked(bit),
        }
    }

    /// Clear both bitmaps. Invoked by a global cache flush.
    pub fn flush(&self) {
        self.stack_bits.clear();
        self.global_bits.clear();
    }
}

impl Default for TypeOracle {
    fn default() -> Self {
        Self::new()
    }
}
