//! Segmented stack memory: `StackSpace` (§4.1) and `ContextStack`/`FrameRegs`
//! (§4.2) built on top of it.

pub mod context;
pub mod frame;
pub mod segment;
pub mod space;

pub use context::{ArgsGuard, ContextStack, ContextStackError, FloatingFrame, FrameGuard, FrameRegsIter, GenGuard};
pub use frame::{FrameFlags, RejoinState, ScriptId, StackFrame};
pub use segment::{FrameRegs, SegmentState, StackSegment};
pub use space::{SlotRange, StackSpace, StackSpaceError};
