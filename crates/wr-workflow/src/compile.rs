//! Lowers an authored definition into an executable, hashed snapshot.
//!
//! Phases run in a fixed order and fail fast on the first error: resolve
//! refs and render prompts, index steps, validate output contracts, resolve
//! loop bodies, derive condition sources, compute the workflow hash. The
//! result is deterministic: compiling the same definition twice yields the
//! same hash.

use crate::condition::Condition;
use crate::contracts::{ContractRegistry, LOOP_CONTROL_CONTRACT};
use crate::model::{
    ConditionSource, CountSource, LeafStep, LoopBody, LoopConfig, LoopKind, LoopStep,
    StepDefinition, WorkflowDefinition,
};
use crate::prompt::{PromptRenderIssue, SnippetRegistry, expand_functions, render_blocks};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use wr_core::{CanonicalJsonError, ContentDigest, Preferences};

/// Safety ceiling for loop iterations.
pub const MAX_ITERATIONS_CEILING: u32 = 1000;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("duplicate step id '{step_id}'")]
    DuplicateStepId { step_id: String },

    #[error("step '{step_id}' declares both prompt and promptBlocks")]
    MixedPromptForms { step_id: String },

    #[error("step '{step_id}' declares neither prompt nor promptBlocks")]
    MissingPrompt { step_id: String },

    #[error("step '{step_id}' references unknown snippet '{name}'")]
    UnknownSnippetRef { step_id: String, name: String },

    #[error("step '{step_id}' calls unknown function '{name}'")]
    UnknownFunction { step_id: String, name: String },

    #[error("step '{step_id}' requires unregistered output contract '{contract}'")]
    UnknownOutputContract { step_id: String, contract: String },

    #[error("loop '{loop_id}' body references unknown step '{step_id}'")]
    UnknownBodyStep { loop_id: String, step_id: String },

    #[error("loop '{loop_id}' nests loop '{inner_id}', which is unsupported")]
    NestedLoop { loop_id: String, inner_id: String },

    #[error("loop '{loop_id}' has an empty body")]
    EmptyLoopBody { loop_id: String },

    #[error("loop '{loop_id}' config is invalid: {reason}")]
    InvalidLoopConfig { loop_id: String, reason: String },

    #[error(
        "loop '{loop_id}' maxIterations {max_iterations} exceeds the ceiling of {MAX_ITERATIONS_CEILING}"
    )]
    MaxIterationsTooHigh { loop_id: String, max_iterations: u32 },

    #[error("workflow hash failed: {0}")]
    Hashing(#[from] CanonicalJsonError),

    #[error("pinned workflow snapshot does not decode: {0}")]
    MalformedPinnedSnapshot(String),
}

/// A leaf step after ref resolution, rendering, and function expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledLeafStep {
    pub id: String,
    pub title: String,
    pub prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_condition: Option<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_contract: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_criteria: Option<Value>,
}

/// A loop after body materialization and condition-source derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledLoop {
    pub id: String,
    pub title: String,
    pub kind: LoopKind,
    pub max_iterations: u32,

    /// Resolved body step ids, in execution order.
    pub body: Vec<String>,

    /// Continuation source for while/until; `None` for for/forEach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_source: Option<ConditionSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<CountSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_var: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_condition: Option<Condition>,
}

/// Any compiled step, discriminated at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stepKind", rename_all = "snake_case")]
pub enum CompiledStep {
    Leaf(CompiledLeafStep),
    Loop(CompiledLoop),
}

impl CompiledStep {
    pub fn id(&self) -> &str {
        match self {
            Self::Leaf(step) => &step.id,
            Self::Loop(step) => &step.id,
        }
    }

    pub fn run_condition(&self) -> Option<&Condition> {
        match self {
            Self::Leaf(step) => step.run_condition.as_ref(),
            Self::Loop(step) => step.run_condition.as_ref(),
        }
    }
}

/// The hashable body of a compiled workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledWorkflowBody {
    pub id: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_preferences: Option<Preferences>,

    /// Top-level step ids in declaration order.
    pub step_order: Vec<String>,

    /// Every step by id, including inline loop body steps.
    pub steps: BTreeMap<String, CompiledStep>,

    /// Ids that must never be selected at top level.
    pub loop_body_step_ids: BTreeSet<String>,
}

/// A compiled workflow plus its content hash.
///
/// The hash is the SHA-256 of the body's canonical JSON, which is also the
/// address of the pinned snapshot: storing [`Self::pinned_body`] in the
/// snapshot store yields exactly [`Self::workflow_hash`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledWorkflow {
    pub body: CompiledWorkflowBody,
    pub workflow_hash: ContentDigest,
}

impl CompiledWorkflow {
    pub fn step(&self, id: &str) -> Option<&CompiledStep> {
        self.body.steps.get(id)
    }

    pub fn leaf(&self, id: &str) -> Option<&CompiledLeafStep> {
        match self.body.steps.get(id) {
            Some(CompiledStep::Leaf(step)) => Some(step),
            _ => None,
        }
    }

    pub fn loop_config(&self, id: &str) -> Option<&CompiledLoop> {
        match self.body.steps.get(id) {
            Some(CompiledStep::Loop(step)) => Some(step),
            _ => None,
        }
    }

    pub fn top_level(&self) -> &[String] {
        &self.body.step_order
    }

    pub fn is_loop_body_step(&self, id: &str) -> bool {
        self.body.loop_body_step_ids.contains(id)
    }

    /// The serializable body for snapshot pinning.
    pub fn pinned_body(&self) -> Result<Value, CanonicalJsonError> {
        serde_json::to_value(&self.body)
            .map_err(|err| CanonicalJsonError::Serialize(err.to_string()))
    }

    /// Rehydrate from a pinned snapshot fetched by `digest`.
    ///
    /// The snapshot store verifies content addressing, so the digest is the
    /// workflow hash by construction.
    pub fn from_pinned(value: Value, digest: ContentDigest) -> Result<Self, CompileError> {
        let body: CompiledWorkflowBody = serde_json::from_value(value)
            .map_err(|err| CompileError::MalformedPinnedSnapshot(err.to_string()))?;
        Ok(Self {
            body,
            workflow_hash: digest,
        })
    }
}

/// Compile a definition against snippet and contract registries.
pub fn compile(
    definition: &WorkflowDefinition,
    snippets: &SnippetRegistry,
    contracts: &ContractRegistry,
) -> Result<CompiledWorkflow, CompileError> {
    if definition.steps.is_empty() {
        return Err(CompileError::EmptyWorkflow);
    }

    let mut steps: BTreeMap<String, CompiledStep> = BTreeMap::new();
    let mut step_order: Vec<String> = Vec::new();
    let mut loop_body_step_ids: BTreeSet<String> = BTreeSet::new();
    // (loop id, unresolved string body ref)
    let mut pending_refs: Vec<(String, String)> = Vec::new();

    let mut index = |steps: &mut BTreeMap<String, CompiledStep>,
                     compiled: CompiledStep|
     -> Result<(), CompileError> {
        let id = compiled.id().to_string();
        if steps.insert(id.clone(), compiled).is_some() {
            return Err(CompileError::DuplicateStepId { step_id: id });
        }
        Ok(())
    };

    for step in &definition.steps {
        match step {
            StepDefinition::Leaf(leaf) => {
                let compiled = compile_leaf(leaf, definition, snippets)?;
                index(&mut steps, CompiledStep::Leaf(compiled))?;
                step_order.push(leaf.id.clone());
            }
            StepDefinition::Loop(loop_step) => {
                validate_loop_config(&loop_step.id, &loop_step.config)?;
                let body = match &loop_step.body {
                    LoopBody::StepRef(target) => {
                        pending_refs.push((loop_step.id.clone(), target.clone()));
                        Vec::new()
                    }
                    LoopBody::Inline(inline) => {
                        if inline.is_empty() {
                            return Err(CompileError::EmptyLoopBody {
                                loop_id: loop_step.id.clone(),
                            });
                        }
                        let mut ids = Vec::with_capacity(inline.len());
                        for inner in inline {
                            let leaf = match inner {
                                StepDefinition::Leaf(leaf) => leaf,
                                StepDefinition::Loop(nested) => {
                                    return Err(CompileError::NestedLoop {
                                        loop_id: loop_step.id.clone(),
                                        inner_id: nested.id.clone(),
                                    });
                                }
                            };
                            let compiled = compile_leaf(leaf, definition, snippets)?;
                            index(&mut steps, CompiledStep::Leaf(compiled))?;
                            loop_body_step_ids.insert(leaf.id.clone());
                            ids.push(leaf.id.clone());
                        }
                        ids
                    }
                };
                let compiled = CompiledLoop {
                    id: loop_step.id.clone(),
                    title: loop_step.title.clone(),
                    kind: loop_step.config.kind,
                    max_iterations: loop_step.config.max_iterations,
                    body,
                    condition_source: None,
                    count: loop_step.config.count.clone(),
                    items: loop_step.config.items.clone(),
                    item_var: loop_step.config.item_var.clone(),
                    index_var: loop_step.config.index_var.clone(),
                    run_condition: loop_step.run_condition.clone(),
                };
                index(&mut steps, CompiledStep::Loop(compiled))?;
                step_order.push(loop_step.id.clone());
            }
        }
    }

    // Validate output contracts now that every step is indexed.
    for step in steps.values() {
        if let CompiledStep::Leaf(leaf) = step {
            if let Some(contract) = &leaf.output_contract {
                if !contracts.contains(contract) {
                    return Err(CompileError::UnknownOutputContract {
                        step_id: leaf.id.clone(),
                        contract: contract.clone(),
                    });
                }
            }
        }
    }

    // Resolve string body refs: they must name an indexed non-loop step.
    for (loop_id, target) in pending_refs {
        match steps.get(&target) {
            None => {
                return Err(CompileError::UnknownBodyStep {
                    loop_id,
                    step_id: target,
                });
            }
            Some(CompiledStep::Loop(_)) => {
                return Err(CompileError::NestedLoop {
                    loop_id,
                    inner_id: target,
                });
            }
            Some(CompiledStep::Leaf(_)) => {}
        }
        loop_body_step_ids.insert(target.clone());
        if let Some(CompiledStep::Loop(loop_step)) = steps.get_mut(&loop_id) {
            loop_step.body = vec![target];
        }
    }

    // Derive condition sources for while/until loops.
    let derived: Vec<(String, Option<ConditionSource>)> = steps
        .values()
        .filter_map(|step| match step {
            CompiledStep::Loop(loop_step) => Some(loop_step),
            CompiledStep::Leaf(_) => None,
        })
        .map(|loop_step| {
            let source = derive_condition_source(loop_step, &steps, definition);
            (loop_step.id.clone(), source)
        })
        .collect();
    for (loop_id, source) in derived {
        if let Some(CompiledStep::Loop(loop_step)) = steps.get_mut(&loop_id) {
            loop_step.condition_source = source;
        }
    }

    let body = CompiledWorkflowBody {
        id: definition.id.clone(),
        version: definition.version.clone(),
        name: definition.name.clone(),
        description: definition.description.clone(),
        recommended_preferences: definition.recommended_preferences,
        step_order,
        steps,
        loop_body_step_ids,
    };

    let workflow_hash = ContentDigest::of_canonical(
        &serde_json::to_value(&body)
            .map_err(|err| CanonicalJsonError::Serialize(err.to_string()))?,
    )?;

    Ok(CompiledWorkflow {
        body,
        workflow_hash,
    })
}

fn compile_leaf(
    leaf: &LeafStep,
    definition: &WorkflowDefinition,
    snippets: &SnippetRegistry,
) -> Result<CompiledLeafStep, CompileError> {
    let step_id = leaf.id.clone();
    let rendered = match (&leaf.prompt, &leaf.prompt_blocks) {
        (Some(_), Some(_)) => return Err(CompileError::MixedPromptForms { step_id }),
        (None, None) => return Err(CompileError::MissingPrompt { step_id }),
        (Some(prompt), None) => prompt.clone(),
        (None, Some(blocks)) => {
            render_blocks(blocks, snippets).map_err(|issue| match issue {
                PromptRenderIssue::UnknownSnippet { name } => CompileError::UnknownSnippetRef {
                    step_id: step_id.clone(),
                    name,
                },
                PromptRenderIssue::UnknownFunction { name } => CompileError::UnknownFunction {
                    step_id: step_id.clone(),
                    name,
                },
            })?
        }
    };

    let prompt = expand_functions(&rendered, &definition.functions).map_err(|issue| match issue {
        PromptRenderIssue::UnknownFunction { name } => CompileError::UnknownFunction {
            step_id: leaf.id.clone(),
            name,
        },
        PromptRenderIssue::UnknownSnippet { name } => CompileError::UnknownSnippetRef {
            step_id: leaf.id.clone(),
            name,
        },
    })?;

    Ok(CompiledLeafStep {
        id: leaf.id.clone(),
        title: leaf.title.clone(),
        prompt,
        run_condition: leaf.run_condition.clone(),
        output_contract: leaf.output_contract.clone(),
        validation_criteria: leaf.validation_criteria.clone(),
    })
}

fn validate_loop_config(loop_id: &str, config: &LoopConfig) -> Result<(), CompileError> {
    if config.max_iterations > MAX_ITERATIONS_CEILING {
        return Err(CompileError::MaxIterationsTooHigh {
            loop_id: loop_id.to_string(),
            max_iterations: config.max_iterations,
        });
    }
    if config.max_iterations == 0 {
        return Err(CompileError::InvalidLoopConfig {
            loop_id: loop_id.to_string(),
            reason: "maxIterations must be at least 1".to_string(),
        });
    }
    match config.kind {
        LoopKind::For if config.count.is_none() => Err(CompileError::InvalidLoopConfig {
            loop_id: loop_id.to_string(),
            reason: "for loops require a count".to_string(),
        }),
        LoopKind::ForEach if config.items.is_none() => Err(CompileError::InvalidLoopConfig {
            loop_id: loop_id.to_string(),
            reason: "forEach loops require an items variable".to_string(),
        }),
        _ => Ok(()),
    }
}

fn derive_condition_source(
    loop_step: &CompiledLoop,
    steps: &BTreeMap<String, CompiledStep>,
    definition: &WorkflowDefinition,
) -> Option<ConditionSource> {
    if !matches!(loop_step.kind, LoopKind::While | LoopKind::Until) {
        return None;
    }

    // Explicit source wins.
    if let Some(explicit) = find_explicit_source(&loop_step.id, definition) {
        return Some(explicit);
    }

    // First body step with the loop-control contract.
    for body_id in &loop_step.body {
        if let Some(CompiledStep::Leaf(leaf)) = steps.get(body_id) {
            if leaf.output_contract.as_deref() == Some(LOOP_CONTROL_CONTRACT) {
                return Some(ConditionSource::ArtifactContract {
                    contract: LOOP_CONTROL_CONTRACT.to_string(),
                    loop_id: loop_step.id.clone(),
                });
            }
        }
    }

    // Legacy context condition.
    find_legacy_condition(&loop_step.id, definition)
        .map(|condition| ConditionSource::ContextVariable { condition })
}

fn find_explicit_source(loop_id: &str, definition: &WorkflowDefinition) -> Option<ConditionSource> {
    definition.steps.iter().find_map(|step| match step {
        StepDefinition::Loop(loop_step) if loop_step.id == loop_id => {
            loop_step.config.condition_source.clone()
        }
        _ => None,
    })
}

fn find_legacy_condition(loop_id: &str, definition: &WorkflowDefinition) -> Option<Condition> {
    definition.steps.iter().find_map(|step| match step {
        StepDefinition::Loop(loop_step) if loop_step.id == loop_id => {
            loop_step.config.condition.clone()
        }
        _ => None,
    })
}

#[cfg(test)]
#[path = "compile_tests.rs"]
mod compile_tests;
