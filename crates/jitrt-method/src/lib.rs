//! MethodJIT: the abstract frame state compilation drives, the per-method
//! compiler that walks bytecode into fast/slow native paths with inline
//! caches, and the recompiler that repairs on-stack frames when those
//! caches' assumptions break.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod compiler;
pub mod frame_state;
pub mod ic;
pub mod recompiler;

pub use compiler::{ArithOp, ArithTemplate, CompileError, JITScript, MethodCompiler, MethodOp};
pub use frame_state::{DataRemat, FrameEntry, FrameState, PhysReg, SyncWrite, TypeRemat, NUM_REGS};
pub use ic::{IcKind, InlineCache, Stub, StubRejection, MAX_STUBS};
pub use recompiler::{
    CallSite, CallSiteKind, FrameOutcome, InlineFrameDescriptor, Interpoline, ObservedFrame, Recompiler,
    RejoinState, ReturnAddressPatch,
};
