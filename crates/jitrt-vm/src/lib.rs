//! Interpreter value model, segmented stack, and the external-collaborator
//! interfaces (bytecode interpreter, object/property model, GC) the JIT
//! tiers are built against.
//!
//! This crate owns nothing that a real embedding would call "the
//! interpreter" — only the `Value` encodings, the stack/segment/frame
//! machinery both JIT tiers drive, and the trait boundaries those external
//! pieces must satisfy.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bytecode;
pub mod stack;
pub mod value;

pub use bytecode::{
    GcRootVisitor, Instruction, InterpreterStep, Opcode, PropId, PropertyCacheProbe, ShapeId, SlotMap, StepOutcome,
};
pub use stack::{
    ArgsGuard, ContextStack, ContextStackError, FloatingFrame, FrameFlags, FrameGuard, FrameRegs, FrameRegsIter,
    GenGuard, RejoinState, ScriptId, SegmentState, SlotRange, StackFrame, StackSegment, StackSpace, StackSpaceError,
};
pub use value::{MagicKind, NunboxValue, ObjRef, PunboxValue, StrRef, Tag, ValueRepr};
