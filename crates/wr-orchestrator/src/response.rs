//! Tool-facing response payloads.
//!
//! Responses are projected from durable facts and deterministic token
//! minting; two calls with identical inputs serialize byte-identically.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use wr_core::{NodeId, Preferences};
use wr_validate::ValidationReport;

/// The pending step an agent should perform next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingStep {
    pub step_id: String,
    pub title: String,
    pub prompt: String,
}

/// What the agent should do with this response. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextIntent {
    PerformPendingThenContinue,
    AwaitUserConfirmation,
    RehydrateOnly,
    Complete,
}

impl NextIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerformPendingThenContinue => "perform_pending_then_continue",
            Self::AwaitUserConfirmation => "await_user_confirmation",
            Self::RehydrateOnly => "rehydrate_only",
            Self::Complete => "complete",
        }
    }
}

/// The already-correct next invocation, so agents never hand-craft tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextCall {
    pub tool: String,
    pub params: Value,
}

impl NextCall {
    pub fn continue_with(state_token: &str, ack_token: Option<&str>) -> Self {
        let mut params = json!({ "stateToken": state_token });
        if let Some(ack) = ack_token {
            params["ackToken"] = json!(ack);
        }
        Self {
            tool: "continue_workflow".to_string(),
            params,
        }
    }

    pub fn rehydrate(state_token: &str) -> Self {
        Self {
            tool: "continue_workflow".to_string(),
            params: json!({ "stateToken": state_token }),
        }
    }
}

/// One blocking finding, projected for the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockerView {
    pub code: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Result of `start_workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub state_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingStep>,

    pub preferences: Preferences,
    pub next_intent: NextIntent,
    pub next_call: NextCall,
    pub is_complete: bool,
}

/// Result kind of `continue_workflow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinueKind {
    Ok,
    Blocked,
}

/// Result of `continue_workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResponse {
    pub kind: ContinueKind,
    pub state_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingStep>,

    pub is_complete: bool,
    pub preferences: Preferences,
    pub next_intent: NextIntent,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_call: Option<NextCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockers: Option<Vec<BlockerView>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_ack_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
}

/// Result of `checkpoint_workflow`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResponse {
    pub checkpoint_node_id: NodeId,
    pub state_token: String,
}

/// One ranked `resume_session` candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeCandidate {
    pub state_token: String,
    pub workflow_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Ranking tier, 1 (best) through 5 (recency fallback).
    pub rank: u8,
}

/// Workflow discovery entry for `list_workflows`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub id: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// `inspect_workflow` detail level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectMode {
    Metadata,
    Preview,
}

/// `inspect_workflow` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInspection {
    pub id: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_preferences: Option<Preferences>,

    pub step_count: usize,

    /// Rendered step previews; present only in preview mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepPreview>>,
}

/// One previewed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPreview {
    pub step_id: String,
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Loop shape summary, e.g. `while(max 5)`, for loop steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_shape: Option<String>,
}
