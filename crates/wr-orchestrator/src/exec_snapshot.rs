//! The execution snapshot body stored per node.
//!
//! A node points at one of these via its `snapshotRef`. Besides the engine
//! state, the snapshot carries the artifacts accumulated so far in the run,
//! so loop continuation decisions replay from content-addressed state alone.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use wr_core::ContentDigest;
use wr_engine::ExecutionState;
use wr_workflow::Artifact;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub engine_state: ExecutionState,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,

    pub workflow_hash: ContentDigest,
}

impl ExecutionSnapshot {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wr_engine::{RunningState, StepInstanceKey};

    #[test]
    fn test_snapshot_round_trip() {
        let snapshot = ExecutionSnapshot {
            engine_state: ExecutionState::Running(RunningState {
                completed: Default::default(),
                loop_stack: Vec::new(),
                pending: Some(StepInstanceKey::top_level("plan")),
            }),
            artifacts: Vec::new(),
            workflow_hash: ContentDigest::of_bytes(b"wf"),
        };
        let value = snapshot.to_value().unwrap();
        assert_eq!(value["engineState"]["kind"], "running");
        let back = ExecutionSnapshot::from_value(value).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_snapshot_is_content_stable() {
        let snapshot = ExecutionSnapshot {
            engine_state: ExecutionState::Complete,
            artifacts: Vec::new(),
            workflow_hash: ContentDigest::of_bytes(b"wf"),
        };
        let a = wr_core::to_canonical_bytes(&snapshot.to_value().unwrap()).unwrap();
        let b = wr_core::to_canonical_bytes(&snapshot.to_value().unwrap()).unwrap();
        assert_eq!(a, b);
    }
}
