//! Backend-agnostic assembler IR, link/repatch buffers, and the executable
//! code cache.
//!
//! Neither JIT tier in this workspace emits machine code directly. Both
//! push pseudo-ops onto an [`ir::AsmBuffer`], hand the finished
//! [`ir::AsmFunction`] to a [`backend::CodegenBackend`], then place the
//! result in the [`cache::CodeCache`] and patch it later through
//! [`cache::RepatchBuffer`] as inline caches and guards get re-targeted.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod cache;
pub mod cranelift_backend;
pub mod ir;

pub use backend::{
    CodegenBackend, CodegenError, CompiledCode, DeoptInfo, ExecutableCode, PointerLocation, Relocation,
    RelocationTarget, StackMapEntry, SymbolResolver, TargetArch, TargetInfo,
};
pub use cache::{CacheId, CodeCache, LinkBuffer, RepatchBuffer, StubBackend};
pub use cranelift_backend::CraneliftBackend;
pub use ir::{AsmBuffer, AsmFunction, AsmOp, CallTarget, Condition, Label, Operand, Reg, RuntimeHelper, UnboundLabelError};
