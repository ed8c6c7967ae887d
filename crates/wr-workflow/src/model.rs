//! The authored workflow definition.
//!
//! Authors write JSON: an identifier, a version, and an ordered list of
//! steps. A step is a leaf (prompted work for the agent) or a loop over a
//! body. The compiler lowers this into a [`crate::compile::CompiledWorkflow`].

use crate::condition::Condition;
use crate::prompt::PromptBlocks;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use wr_core::Preferences;

/// Author input for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Advisory execution preferences; never enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_preferences: Option<Preferences>,

    /// Named prompt fragments expandable via `{{fn:name}}` markers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub functions: BTreeMap<String, String>,

    pub steps: Vec<StepDefinition>,
}

/// A step is either a loop over a body or a leaf.
///
/// Untagged on purpose: a loop step is recognized by its `loop` field, which
/// leaf steps never carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepDefinition {
    Loop(LoopStep),
    Leaf(LeafStep),
}

impl StepDefinition {
    pub fn id(&self) -> &str {
        match self {
            Self::Loop(step) => &step.id,
            Self::Leaf(step) => &step.id,
        }
    }
}

/// A prompted unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafStep {
    pub id: String,
    pub title: String,

    /// Raw prompt text. Mutually exclusive with `promptBlocks`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Structured prompt rendered in a locked section order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_blocks: Option<PromptBlocks>,

    /// Skip this step instance when the condition is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_condition: Option<Condition>,

    /// Id of a registered artifact contract the step output must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_contract: Option<String>,

    /// Legacy free-form validation criteria.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_criteria: Option<Value>,
}

/// A loop step: config plus a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStep {
    pub id: String,
    pub title: String,

    #[serde(rename = "loop")]
    pub config: LoopConfig,

    pub body: LoopBody,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_condition: Option<Condition>,
}

/// Loop body: a reference to a declared step, or an inline sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopBody {
    StepRef(String),
    Inline(Vec<StepDefinition>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopKind {
    While,
    Until,
    For,
    ForEach,
}

impl LoopKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::While => "while",
            Self::Until => "until",
            Self::For => "for",
            Self::ForEach => "forEach",
        }
    }
}

/// Where a while/until loop's continuation decision comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ConditionSource {
    /// Continuation decided by the latest artifact of `contract` kind for
    /// this loop. Context is never consulted on this branch.
    #[serde(rename_all = "camelCase")]
    ArtifactContract { contract: String, loop_id: String },

    /// Continuation decided by evaluating `condition` against context.
    /// Artifacts are never consulted on this branch.
    #[serde(rename_all = "camelCase")]
    ContextVariable { condition: Condition },
}

/// Iteration count for `for` loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CountSource {
    Literal(u32),
    ContextVar(String),
}

/// Loop configuration as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    pub kind: LoopKind,
    pub max_iterations: u32,

    /// Legacy context condition for while/until.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    /// Explicit condition source; overrides derivation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_source: Option<ConditionSource>,

    /// Iteration count for `for`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<CountSource>,

    /// Context variable holding the array for `forEach`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<String>,

    /// Context name bound to the current item in `forEach` prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_var: Option<String>,

    /// Context name bound to the current index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_leaf_step_parses() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "plan",
            "title": "Plan the change",
            "prompt": "Write a plan.",
        }))
        .unwrap();
        assert!(matches!(step, StepDefinition::Leaf(_)));
        assert_eq!(step.id(), "plan");
    }

    #[test]
    fn test_loop_step_recognized_by_loop_field() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "retry-loop",
            "title": "Fix until green",
            "loop": {"kind": "until", "maxIterations": 5, "condition": {"var": "testsPass", "equals": true}},
            "body": "fix-step",
        }))
        .unwrap();
        match step {
            StepDefinition::Loop(loop_step) => {
                assert_eq!(loop_step.config.kind, LoopKind::Until);
                assert_eq!(loop_step.config.max_iterations, 5);
                assert_eq!(loop_step.body, LoopBody::StepRef("fix-step".to_string()));
            }
            StepDefinition::Leaf(_) => panic!("expected a loop step"),
        }
    }

    #[test]
    fn test_inline_loop_body_parses() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "each-file",
            "title": "Process each file",
            "loop": {"kind": "forEach", "maxIterations": 100, "items": "files", "itemVar": "file"},
            "body": [
                {"id": "process", "title": "Process one file", "prompt": "Process {{file}}."}
            ],
        }))
        .unwrap();
        match step {
            StepDefinition::Loop(loop_step) => match loop_step.body {
                LoopBody::Inline(steps) => assert_eq!(steps.len(), 1),
                LoopBody::StepRef(_) => panic!("expected inline body"),
            },
            StepDefinition::Leaf(_) => panic!("expected a loop step"),
        }
    }

    #[test]
    fn test_workflow_definition_round_trip() {
        let definition = WorkflowDefinition {
            id: "release".to_string(),
            version: "2.1.0".to_string(),
            name: Some("Release train".to_string()),
            description: None,
            recommended_preferences: None,
            functions: BTreeMap::new(),
            steps: vec![StepDefinition::Leaf(LeafStep {
                id: "ship".to_string(),
                title: "Ship it".to_string(),
                prompt: Some("Ship the release.".to_string()),
                prompt_blocks: None,
                run_condition: None,
                output_contract: None,
                validation_criteria: None,
            })],
        };
        let json = serde_json::to_string(&definition).unwrap();
        let back: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, definition);
    }

    #[test]
    fn test_count_source_forms() {
        let literal: CountSource = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(literal, CountSource::Literal(3));
        let var: CountSource = serde_json::from_value(json!("retries")).unwrap();
        assert_eq!(var, CountSource::ContextVar("retries".to_string()));
    }

    #[test]
    fn test_condition_source_tagging() {
        let source: ConditionSource = serde_json::from_value(json!({
            "source": "artifact_contract",
            "contract": "wr.contracts.loop_control",
            "loopId": "retry-loop",
        }))
        .unwrap();
        assert!(matches!(source, ConditionSource::ArtifactContract { .. }));
    }
}
