//! Execution state: an immutable value advanced by explicit events.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One `(loopId, iteration)` frame of a step instance's loop path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopPathEntry {
    pub loop_id: String,
    pub iteration: u32,
}

/// Identifies a specific execution of a step within nested loops.
///
/// Equality is structural. The derived ordering (step id, then loop path)
/// is the canonical serialization order of the `completed` set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInstanceKey {
    pub step_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loop_path: Vec<LoopPathEntry>,
}

impl StepInstanceKey {
    /// A top-level instance (empty loop path).
    pub fn top_level(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            loop_path: Vec::new(),
        }
    }

    pub fn in_loops(step_id: impl Into<String>, loop_path: Vec<LoopPathEntry>) -> Self {
        Self {
            step_id: step_id.into(),
            loop_path,
        }
    }
}

impl std::fmt::Display for StepInstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.step_id)?;
        for entry in &self.loop_path {
            write!(f, "@{}#{}", entry.loop_id, entry.iteration)?;
        }
        Ok(())
    }
}

/// Progress through one loop. Iterations count from 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopFrame {
    pub loop_id: String,
    pub iteration: u32,
    pub body_index: usize,
}

/// The running portion of the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningState {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub completed: BTreeSet<StepInstanceKey>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loop_stack: Vec<LoopFrame>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<StepInstanceKey>,
}

/// Whether a block can be retried by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSeverity {
    Retryable,
    Terminal,
}

/// One blocking finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockerEntry {
    pub code: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Details of a blocked attempt, attached to a running state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockerRecord {
    pub kind: BlockSeverity,
    pub blockers: Vec<BlockerEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempt_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_ref: Option<String>,
}

/// The execution state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionState {
    /// Before the first step is selected.
    Init,

    Running(RunningState),

    /// A running state halted by blockers; `engine` is the state to resume
    /// from once the block clears.
    Blocked {
        engine: RunningState,
        blocker: BlockerRecord,
    },

    Complete,
}

impl ExecutionState {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running(_) => "running",
            Self::Blocked { .. } => "blocked",
            Self::Complete => "complete",
        }
    }
}

/// Events that advance the execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    StepCompleted { step_instance_key: StepInstanceKey },

    #[serde(rename_all = "camelCase")]
    LoopIterEnded { loop_id: String },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("event {event} does not apply to state '{state}'")]
    InvalidTransition { state: &'static str, event: String },
}

/// Apply an event, returning the successor state.
pub fn apply_event(
    state: &ExecutionState,
    event: &EngineEvent,
) -> Result<ExecutionState, TransitionError> {
    let invalid = || TransitionError::InvalidTransition {
        state: state.kind_name(),
        event: format!("{event:?}"),
    };

    match (state, event) {
        (
            ExecutionState::Running(running),
            EngineEvent::StepCompleted { step_instance_key },
        ) => {
            if running.pending.as_ref() != Some(step_instance_key) {
                return Err(invalid());
            }
            let mut next = running.clone();
            next.pending = None;
            next.completed.insert(step_instance_key.clone());
            Ok(ExecutionState::Running(next))
        }
        (ExecutionState::Running(running), EngineEvent::LoopIterEnded { loop_id }) => {
            let Some(frame) = running.loop_stack.last() else {
                return Err(invalid());
            };
            if &frame.loop_id != loop_id || running.pending.is_some() {
                return Err(invalid());
            }
            let mut next = running.clone();
            let frame = next
                .loop_stack
                .last_mut()
                .ok_or_else(invalid)?;
            frame.iteration += 1;
            frame.body_index = 0;
            Ok(ExecutionState::Running(next))
        }
        _ => Err(invalid()),
    }
}
