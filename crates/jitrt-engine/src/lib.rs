//! The facade crate tying TraceJIT (`jitrt-trace`) and MethodJIT
//! (`jitrt-method`) together behind the five interpreter-facing calls and
//! two host-facing calls named in the design's external-interfaces
//! section, sharing one `jitrt_asm::CodeCache` between both tiers.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod engine;
pub mod host;

pub use config::EngineConfig;
pub use engine::{Engine, LoopEdgeOutcome};
pub use host::{expand_inline_frames, mark_stack, ExpansionScope};
