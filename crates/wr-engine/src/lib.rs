//! The workflow interpreter: a pure state machine over compiled workflows.

pub mod interpreter;
pub mod state;

pub use interpreter::{InterpreterError, NextOutcome, TraceEntry, TraceKind, next};
pub use state::{
    BlockSeverity, BlockerEntry, BlockerRecord, EngineEvent, ExecutionState, LoopFrame,
    LoopPathEntry, RunningState, StepInstanceKey, TransitionError, apply_event,
};
