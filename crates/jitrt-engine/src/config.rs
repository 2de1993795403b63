//! `EngineConfig`: the small `Default`-able knobs both tiers are
//! constructed with, rather than a file-based configuration system — there
//! is nothing here for an embedder to load from disk, only constants an
//! embedder may want to override before the first script runs.

/// Tuning knobs for one compartment's [`crate::Engine`]. Every field
/// defaults to the historical implementation's hardcoded constant; an
/// embedder trading warmup latency against steady-state throughput can
/// override any of them.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Hits on a loop-back-edge PC before the trace tier starts recording.
    /// Defaults to [`jitrt_trace::DEFAULT_HOT_THRESHOLD`].
    pub trace_hot_threshold: u32,
    /// Hits on a guard's side exit before the trace tier considers
    /// extending the tree at that exit. Defaults to `0`, matching §4.6's
    /// "also 0 by default in this design".
    pub trace_extension_threshold: u32,
    /// Size (in bits) of each of `TypeOracle`'s two bitmaps. Defaults to
    /// [`jitrt_trace::DEFAULT_ORACLE_SIZE`].
    pub oracle_size: usize,
    /// Maximum resident bytes of native code across both tiers' shared
    /// `jitrt_asm::CodeCache`.
    pub code_cache_max_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            trace_hot_threshold: jitrt_trace::DEFAULT_HOT_THRESHOLD,
            trace_extension_threshold: 0,
            oracle_size: jitrt_trace::DEFAULT_ORACLE_SIZE,
            code_cache_max_bytes: 64 * 1024 * 1024,
        }
    }
}
