//! Durable domain events.
//!
//! Events are the append-only truth of a session. They never mutate;
//! identity is the `eventId` and idempotency is the per-session unique
//! `dedupeKey`. The envelope is versioned so old logs stay readable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use wr_core::{AttemptId, ContentDigest, NodeId, RunId, SessionId};

pub use wr_core::{Autonomy, Preferences, RiskPolicy};

/// Envelope schema version for event records.
pub const EVENT_SCHEMA_VERSION: u8 = 1;

/// Identity of a single durable event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn mint() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional run/node scope tag on an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

impl EventScope {
    pub fn run(run_id: RunId) -> Self {
        Self {
            run_id: Some(run_id),
            node_id: None,
        }
    }

    pub fn node(run_id: RunId, node_id: NodeId) -> Self {
        Self {
            run_id: Some(run_id),
            node_id: Some(node_id),
        }
    }
}

/// Kind of node in the execution DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Step,
    BlockedAttempt,
    Checkpoint,
}

/// Recorded reason an edge was created when advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCause {
    AckedStep,
    IntentionalFork,
    NonTipAdvance,
}

/// Whether a blocked attempt may be retried by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerKind {
    Retryable,
    Terminal,
}

/// One blocking finding attached to a blocked attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blocker {
    pub code: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Severity of a recorded preference gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapSeverity {
    Warning,
}

/// Outcome recorded for one advance attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    #[serde(rename_all = "camelCase")]
    Advanced { to_node_id: NodeId },

    #[serde(rename_all = "camelCase")]
    Blocked {
        to_node_id: NodeId,
        blocker_kind: BlockerKind,
        blockers: Vec<Blocker>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation_ref: Option<ContentDigest>,
    },
}

/// The closed set of durable event kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventBody {
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_path: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    RunStarted {
        workflow_id: String,
        workflow_hash: ContentDigest,
    },

    #[serde(rename_all = "camelCase")]
    NodeCreated {
        node_id: NodeId,
        node_kind: NodeKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_node_id: Option<NodeId>,
        workflow_hash: ContentDigest,
        snapshot_ref: ContentDigest,
        attempt_id: AttemptId,
    },

    #[serde(rename_all = "camelCase")]
    PreferencesChanged { preferences: Preferences },

    #[serde(rename_all = "camelCase")]
    ContextSet { patch: Value },

    #[serde(rename_all = "camelCase")]
    AdvanceRecorded {
        attempt_id: AttemptId,
        cause: EdgeCause,
        outcome: AdvanceOutcome,
    },

    #[serde(rename_all = "camelCase")]
    NodeOutputAppended { markdown: String },

    #[serde(rename_all = "camelCase")]
    EdgeCreated {
        from_node_id: NodeId,
        to_node_id: NodeId,
        cause: EdgeCause,
    },

    #[serde(rename_all = "camelCase")]
    ObservationRecorded { key: String, value: Value },

    #[serde(rename_all = "camelCase")]
    CapabilityObserved { name: String, value: Value },

    #[serde(rename_all = "camelCase")]
    GapRecorded {
        severity: GapSeverity,
        message: String,
    },

    #[serde(rename_all = "camelCase")]
    ValidationRecorded {
        step_id: String,
        valid: bool,
        issues: Vec<String>,
        suggestions: Vec<String>,
    },
}

impl EventBody {
    /// Stable name used in dedupe keys and diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::RunStarted { .. } => "run_started",
            Self::NodeCreated { .. } => "node_created",
            Self::PreferencesChanged { .. } => "preferences_changed",
            Self::ContextSet { .. } => "context_set",
            Self::AdvanceRecorded { .. } => "advance_recorded",
            Self::NodeOutputAppended { .. } => "node_output_appended",
            Self::EdgeCreated { .. } => "edge_created",
            Self::ObservationRecorded { .. } => "observation_recorded",
            Self::CapabilityObserved { .. } => "capability_observed",
            Self::GapRecorded { .. } => "gap_recorded",
            Self::ValidationRecorded { .. } => "validation_recorded",
        }
    }

    /// Snapshot ref introduced by this event, if any.
    ///
    /// Every introduced ref must be attested by a `snapshot_pinned` manifest
    /// record after the enclosing segment closes.
    pub fn introduced_snapshot_ref(&self) -> Option<&ContentDigest> {
        match self {
            Self::NodeCreated { snapshot_ref, .. } => Some(snapshot_ref),
            _ => None,
        }
    }
}

/// One durable, numbered, scope-tagged event record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub v: u8,
    pub event_id: EventId,
    pub event_index: u64,
    pub session_id: SessionId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<EventScope>,

    pub dedupe_key: String,
    pub occurred_at: DateTime<Utc>,

    #[serde(flatten)]
    pub body: EventBody,
}

impl EventEnvelope {
    pub fn new(
        event_index: u64,
        session_id: SessionId,
        scope: Option<EventScope>,
        dedupe_key: String,
        body: EventBody,
    ) -> Self {
        Self {
            v: EVENT_SCHEMA_VERSION,
            event_id: EventId::mint(),
            event_index,
            session_id,
            scope,
            dedupe_key,
            occurred_at: Utc::now(),
            body,
        }
    }
}

/// Dedupe key for an advance attempt at a node.
pub fn advance_dedupe_key(session: &SessionId, node: &NodeId, attempt: &AttemptId) -> String {
    format!("advance_recorded:{session}:{node}:{attempt}")
}

/// Dedupe key for a checkpoint attempt at a node.
pub fn checkpoint_dedupe_key(session: &SessionId, node: &NodeId, attempt: &AttemptId) -> String {
    format!("checkpoint:{session}:{node}:{attempt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> EventEnvelope {
        EventEnvelope::new(
            0,
            SessionId::mint(),
            None,
            "session_created:test".to_string(),
            EventBody::SessionCreated {
                workspace_path: Some("/tmp/repo".to_string()),
            },
        )
    }

    #[test]
    fn test_envelope_serializes_kind_and_data() {
        let envelope = sample_envelope();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["kind"], "session_created");
        assert_eq!(json["data"]["workspacePath"], "/tmp/repo");
        assert_eq!(json["eventIndex"], 0);
        assert!(json["dedupeKey"].is_string());
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = sample_envelope();
        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_advance_outcome_round_trip() {
        let node = NodeId::mint();
        let outcome = AdvanceOutcome::Blocked {
            to_node_id: node.clone(),
            blocker_kind: BlockerKind::Retryable,
            blockers: vec![Blocker {
                code: "output_contract_violation".to_string(),
                message: "output is not an object".to_string(),
                suggestion: Some("return a JSON object".to_string()),
            }],
            validation_ref: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["result"], "blocked");
        assert_eq!(json["blockerKind"], "retryable");
        let back: AdvanceOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn test_unknown_kind_fails_to_parse() {
        let mut json = serde_json::to_value(sample_envelope()).unwrap();
        json["kind"] = serde_json::json!("session_obliterated");
        assert!(serde_json::from_value::<EventEnvelope>(json).is_err());
    }

    #[test]
    fn test_introduced_snapshot_ref_only_on_node_created() {
        let snapshot = ContentDigest::of_bytes(b"snapshot");
        let body = EventBody::NodeCreated {
            node_id: NodeId::mint(),
            node_kind: NodeKind::Step,
            parent_node_id: None,
            workflow_hash: ContentDigest::of_bytes(b"wf"),
            snapshot_ref: snapshot,
            attempt_id: AttemptId::mint(),
        };
        assert_eq!(body.introduced_snapshot_ref(), Some(&snapshot));

        let other = EventBody::NodeOutputAppended {
            markdown: "done".to_string(),
        };
        assert_eq!(other.introduced_snapshot_ref(), None);
    }

    #[test]
    fn test_kind_names_cover_the_closed_set() {
        let names = [
            "session_created",
            "run_started",
            "node_created",
            "preferences_changed",
            "context_set",
            "advance_recorded",
            "node_output_appended",
            "edge_created",
            "observation_recorded",
            "capability_observed",
            "gap_recorded",
            "validation_recorded",
        ];
        // Serialized tag must agree with kind_name for every variant we emit.
        let body = EventBody::GapRecorded {
            severity: GapSeverity::Warning,
            message: "autonomy above recommendation".to_string(),
        };
        let tag = serde_json::to_value(&body).unwrap()["kind"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(tag, body.kind_name());
        assert!(names.contains(&body.kind_name()));
    }

    #[test]
    fn test_dedupe_key_formats() {
        let session = SessionId::mint();
        let node = NodeId::mint();
        let attempt = AttemptId::mint();
        let key = advance_dedupe_key(&session, &node, &attempt);
        assert_eq!(
            key,
            format!("advance_recorded:{session}:{node}:{attempt}")
        );
        assert!(checkpoint_dedupe_key(&session, &node, &attempt).starts_with("checkpoint:"));
    }

}
