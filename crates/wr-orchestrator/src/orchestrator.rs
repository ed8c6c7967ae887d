//! The token-based execution API: start, continue, checkpoint.
//!
//! Mutating operations serialize through the per-session lock and append
//! event plans atomically; read paths (rehydrate, inspection) never take
//! the lock. Every response is projected from durable facts plus
//! deterministic token minting, so identical requests yield identical
//! responses.

use crate::config::{load_or_create_token_key, resolve_data_dir};
use crate::context_budget::validate_context;
use crate::error::{ToolError, ToolErrorCode};
use crate::exec_snapshot::ExecutionSnapshot;
use crate::ports::{WorkflowSource, WorkspaceProbe};
use crate::projection::{effective_context, effective_preferences};
use crate::response::{
    CheckpointResponse, ContinueKind, ContinueResponse, InspectMode, NextCall, NextIntent,
    PendingStep, StartResponse, StepPreview, WorkflowInspection, WorkflowSummary,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use wr_core::{AttemptId, ContentDigest, NodeId, Preferences, RunId, SessionId};
use wr_engine::{BlockSeverity, ExecutionState, StepInstanceKey};
use wr_store::{
    AppendPlan, EventBody, EventEnvelope, EventScope, NodeKind, SessionLogState, SnapshotPin,
    SnapshotStore, checkpoint_dedupe_key, load_session_state, open_session_healthy, session_dir,
};
use wr_token::{AckPayload, StatePayload, TokenCodec};
use wr_workflow::{
    CompiledStep, CompiledWorkflow, ContractRegistry, LoopKind, SnippetRegistry, compile,
};

/// Bound on stored step output, in bytes of markdown.
pub const NODE_OUTPUT_LIMIT_BYTES: usize = 4096;

/// A parsed view of one `node_created` fact.
#[derive(Debug, Clone)]
pub(crate) struct NodeView {
    pub node_id: NodeId,
    pub node_kind: NodeKind,
    pub run_id: RunId,
    pub workflow_hash: ContentDigest,
    pub snapshot_ref: ContentDigest,
    pub attempt_id: AttemptId,
}

pub(crate) fn node_view(state: &SessionLogState, node_id: &NodeId) -> Option<NodeView> {
    let event = state.node_created(node_id)?;
    let run_id = event.scope.as_ref()?.run_id.clone()?;
    match &event.body {
        EventBody::NodeCreated {
            node_id,
            node_kind,
            workflow_hash,
            snapshot_ref,
            attempt_id,
            ..
        } => Some(NodeView {
            node_id: node_id.clone(),
            node_kind: *node_kind,
            run_id,
            workflow_hash: *workflow_hash,
            snapshot_ref: *snapshot_ref,
            attempt_id: attempt_id.clone(),
        }),
        _ => None,
    }
}

/// Inputs for `continue_workflow`.
#[derive(Debug, Clone, Default)]
pub struct ContinueRequest {
    pub state_token: String,
    pub ack_token: Option<String>,
    pub intent: Option<String>,
    pub context: Option<Value>,
    pub output: Option<String>,
}

/// The execution orchestrator. Ports are explicit constructor arguments;
/// the only process-wide state is the data directory path.
pub struct Orchestrator {
    pub(crate) data_dir: PathBuf,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) tokens: TokenCodec,
    pub(crate) workflows: Box<dyn WorkflowSource>,
    pub(crate) workspace: Box<dyn WorkspaceProbe>,
    pub(crate) snippets: SnippetRegistry,
    pub(crate) contracts: ContractRegistry,
}

impl Orchestrator {
    pub fn new(
        data_dir: Option<&Path>,
        workflows: Box<dyn WorkflowSource>,
        workspace: Box<dyn WorkspaceProbe>,
    ) -> Result<Self, ToolError> {
        let data_dir = resolve_data_dir(data_dir)?;
        let key = load_or_create_token_key(&data_dir)?;
        Ok(Self {
            snapshots: SnapshotStore::new(&data_dir),
            tokens: TokenCodec::new(key),
            data_dir,
            workflows,
            workspace,
            snippets: SnippetRegistry::new(),
            contracts: ContractRegistry::builtin(),
        })
    }

    pub fn with_snippets(mut self, snippets: SnippetRegistry) -> Self {
        self.snippets = snippets;
        self
    }

    pub fn with_contracts(mut self, contracts: ContractRegistry) -> Self {
        self.contracts = contracts;
        self
    }

    // ── Discovery ────────────────────────────────────────────────────

    pub fn list_workflows(&self) -> Vec<WorkflowSummary> {
        self.workflows
            .list()
            .into_iter()
            .filter_map(|id| self.workflows.get(&id))
            .map(|definition| WorkflowSummary {
                id: definition.id,
                version: definition.version,
                name: definition.name,
                description: definition.description,
            })
            .collect()
    }

    pub fn inspect_workflow(
        &self,
        workflow_id: &str,
        mode: InspectMode,
    ) -> Result<WorkflowInspection, ToolError> {
        let definition = self
            .workflows
            .get(workflow_id)
            .ok_or_else(|| ToolError::not_found(format!("workflow '{workflow_id}' not found")))?;
        let compiled = compile(&definition, &self.snippets, &self.contracts)?;

        let steps = match mode {
            InspectMode::Metadata => None,
            InspectMode::Preview => Some(
                compiled
                    .top_level()
                    .iter()
                    .filter_map(|id| compiled.step(id))
                    .map(|step| match step {
                        CompiledStep::Leaf(leaf) => StepPreview {
                            step_id: leaf.id.clone(),
                            title: leaf.title.clone(),
                            prompt: Some(leaf.prompt.clone()),
                            loop_shape: None,
                        },
                        CompiledStep::Loop(loop_step) => StepPreview {
                            step_id: loop_step.id.clone(),
                            title: loop_step.title.clone(),
                            prompt: None,
                            loop_shape: Some(format!(
                                "{}(max {})",
                                loop_step.kind.as_str(),
                                loop_step.max_iterations
                            )),
                        },
                    })
                    .collect(),
            ),
        };

        Ok(WorkflowInspection {
            id: compiled.body.id.clone(),
            version: compiled.body.version.clone(),
            name: compiled.body.name.clone(),
            description: compiled.body.description.clone(),
            recommended_preferences: compiled.body.recommended_preferences,
            step_count: compiled.top_level().len(),
            steps,
        })
    }

    // ── Start ────────────────────────────────────────────────────────

    pub fn start_workflow(
        &self,
        workflow_id: &str,
        context: Option<&Value>,
        workspace_path: Option<&Path>,
    ) -> Result<StartResponse, ToolError> {
        let definition = self
            .workflows
            .get(workflow_id)
            .ok_or_else(|| ToolError::not_found(format!("workflow '{workflow_id}' not found")))?;
        let compiled = compile(&definition, &self.snippets, &self.contracts)?;

        let context = context.map(validate_context).transpose()?.unwrap_or_default();

        // Pin the compiled workflow; its blob digest is the workflow hash.
        let pinned_body = compiled
            .pinned_body()
            .map_err(|err| ToolError::internal(err.to_string()))?;
        let workflow_ref = self.snapshots.put(&pinned_body)?;

        let session_id = SessionId::mint();
        let run_id = RunId::mint();
        let node_id = NodeId::mint();
        let attempt_id = AttemptId::mint();

        let outcome = wr_engine::next(&compiled, &ExecutionState::Init, &context, &[])?;
        let snapshot = ExecutionSnapshot {
            engine_state: outcome.state.clone(),
            artifacts: Vec::new(),
            workflow_hash: compiled.workflow_hash,
        };
        let snapshot_value = snapshot
            .to_value()
            .map_err(|err| ToolError::internal(err.to_string()))?;
        let snapshot_ref = self.snapshots.put(&snapshot_value)?;

        let requested_preferences = preferences_from_context(&context)?;
        let preferences = requested_preferences.unwrap_or_default();

        let mut events: Vec<EventEnvelope> = Vec::new();
        let mut push = |scope: Option<EventScope>, dedupe: String, body: EventBody| {
            let index = events.len() as u64;
            events.push(EventEnvelope::new(index, session_id.clone(), scope, dedupe, body));
            index
        };

        push(
            None,
            format!("session_created:{session_id}"),
            EventBody::SessionCreated {
                workspace_path: workspace_path.map(|p| p.display().to_string()),
            },
        );
        let run_started_index = push(
            Some(EventScope::run(run_id.clone())),
            format!("run_started:{run_id}"),
            EventBody::RunStarted {
                workflow_id: workflow_id.to_string(),
                workflow_hash: compiled.workflow_hash,
            },
        );
        let node_created_index = push(
            Some(EventScope::node(run_id.clone(), node_id.clone())),
            format!("node_created:{node_id}"),
            EventBody::NodeCreated {
                node_id: node_id.clone(),
                node_kind: NodeKind::Step,
                parent_node_id: None,
                workflow_hash: compiled.workflow_hash,
                snapshot_ref,
                attempt_id: attempt_id.clone(),
            },
        );
        push(
            None,
            format!("preferences_changed:{session_id}:0"),
            EventBody::PreferencesChanged { preferences },
        );
        if !context.is_empty() {
            push(
                None,
                format!("context_set:{session_id}:0"),
                EventBody::ContextSet {
                    patch: Value::Object(context.clone()),
                },
            );
        }
        if let Some(path) = workspace_path {
            let snapshot = self.workspace.snapshot(path);
            if let Some(head) = snapshot.head {
                push(
                    None,
                    format!("observation:{session_id}:git.head"),
                    EventBody::ObservationRecorded {
                        key: "git.head".to_string(),
                        value: Value::String(head),
                    },
                );
            }
            if let Some(branch) = snapshot.branch {
                push(
                    None,
                    format!("observation:{session_id}:git.branch"),
                    EventBody::ObservationRecorded {
                        key: "git.branch".to_string(),
                        value: Value::String(branch),
                    },
                );
            }
        }
        if let Some(capabilities) = context.get("capabilities").and_then(Value::as_object) {
            for (name, value) in capabilities {
                push(
                    Some(EventScope::node(run_id.clone(), node_id.clone())),
                    format!("capability:{node_id}:{name}"),
                    EventBody::CapabilityObserved {
                        name: name.clone(),
                        value: value.clone(),
                    },
                );
            }
        }
        if requested_preferences.is_some() {
            self.push_gap_events(&compiled, preferences, &session_id, 0, &mut events);
        }

        let run_started_id = events[run_started_index as usize].event_id.clone();
        let node_created_id = events[node_created_index as usize].event_id.clone();
        let plan = AppendPlan {
            events,
            snapshot_pins: vec![
                SnapshotPin {
                    snapshot_ref: workflow_ref,
                    event_index: run_started_index,
                    created_by_event_id: run_started_id,
                },
                SnapshotPin {
                    snapshot_ref,
                    event_index: node_created_index,
                    created_by_event_id: node_created_id,
                },
            ],
        };

        let session_path = session_dir(&self.data_dir, &session_id);
        let mut witness = open_session_healthy(&session_path, &session_id, "start_workflow")?;
        witness.append(plan)?;
        drop(witness);

        tracing::info!(
            session_id = %session_id,
            workflow_id,
            workflow_hash = %compiled.workflow_hash,
            "workflow started"
        );

        let state_token = self.sign_state(&session_id, &run_id, &node_id, &compiled);
        let pending = outcome
            .next
            .as_ref()
            .map(|key| self.render_pending_with_loop_vars(&compiled, key, None, &context))
            .transpose()?;
        let (ack_token, checkpoint_token) = if pending.is_some() {
            (
                Some(self.sign_ack(&session_id, &run_id, &node_id, &attempt_id)),
                Some(self.sign_checkpoint(&session_id, &run_id, &node_id, &attempt_id)),
            )
        } else {
            (None, None)
        };

        let next_intent = if outcome.is_complete {
            NextIntent::Complete
        } else {
            NextIntent::PerformPendingThenContinue
        };
        let next_call = match &ack_token {
            Some(ack) => NextCall::continue_with(&state_token, Some(ack)),
            None => NextCall::rehydrate(&state_token),
        };

        Ok(StartResponse {
            state_token,
            ack_token,
            checkpoint_token,
            pending,
            preferences,
            next_intent,
            next_call,
            is_complete: outcome.is_complete,
        })
    }

    // ── Continue ─────────────────────────────────────────────────────

    pub fn continue_workflow(
        &self,
        request: ContinueRequest,
    ) -> Result<ContinueResponse, ToolError> {
        if let Some(intent) = request.intent.as_deref() {
            validate_declared_intent(intent)?;
        }

        let state_payload = self.tokens.verify_state(&request.state_token)?;
        let session_path = session_dir(&self.data_dir, &state_payload.session_id);
        if !session_path.exists() {
            return Err(ToolError::not_found(format!(
                "session '{}' has no durable state",
                state_payload.session_id
            )));
        }

        match &request.ack_token {
            None => self.rehydrate(&session_path, &state_payload),
            Some(ack_token) => {
                let ack_payload = self.tokens.verify_ack(ack_token)?;
                wr_token::assert_scope_matches(&state_payload, &ack_payload)?;
                self.advance(&session_path, &state_payload, &ack_payload, &request)
            }
        }
    }

    /// Pure query: no ack, no durable writes.
    fn rehydrate(
        &self,
        session_path: &Path,
        payload: &StatePayload,
    ) -> Result<ContinueResponse, ToolError> {
        let log = load_session_state(session_path, &payload.session_id)?;
        let node = node_view(&log, &payload.node_id)
            .ok_or_else(|| unknown_node(&payload.node_id))?;
        self.check_hash_ref(payload, &node)?;

        let compiled = self.load_pinned_workflow(&node.workflow_hash)?;
        let snapshot = self.load_exec_snapshot(&node.snapshot_ref)?;
        let preferences = effective_preferences(&log);
        let state_token = self.sign_state(&payload.session_id, &node.run_id, &node.node_id, &compiled);

        match &snapshot.engine_state {
            ExecutionState::Complete => Ok(ContinueResponse {
                kind: ContinueKind::Ok,
                state_token: state_token.clone(),
                ack_token: None,
                checkpoint_token: None,
                pending: None,
                is_complete: true,
                preferences,
                next_intent: NextIntent::Complete,
                next_call: None,
                blockers: None,
                retryable: None,
                retry_ack_token: None,
                validation: None,
            }),
            ExecutionState::Running(running) => {
                let pending_key = running.pending.clone().ok_or_else(|| {
                    ToolError::internal("stored running state has no pending step")
                })?;
                let context = effective_context(&log);
                let pending = self.render_pending_with_loop_vars(
                    &compiled,
                    &pending_key,
                    None,
                    &context,
                )?;

                // A fresh ack for convenience; rehydrating at a non-tip node
                // mints a fork attempt so the later advance is recorded as
                // intentional.
                let children = advance_children(&log, &node.node_id);
                let attempt = if children.is_empty() {
                    node.attempt_id.clone()
                } else {
                    node.attempt_id.derive_fork(children.len())
                };
                let ack_token =
                    self.sign_ack(&payload.session_id, &node.run_id, &node.node_id, &attempt);
                let checkpoint_token = self.sign_checkpoint(
                    &payload.session_id,
                    &node.run_id,
                    &node.node_id,
                    &attempt,
                );
                let next_call = NextCall::continue_with(&state_token, Some(&ack_token));
                Ok(ContinueResponse {
                    kind: ContinueKind::Ok,
                    state_token,
                    ack_token: Some(ack_token),
                    checkpoint_token: Some(checkpoint_token),
                    pending: Some(pending),
                    is_complete: false,
                    preferences,
                    next_intent: NextIntent::PerformPendingThenContinue,
                    next_call: Some(next_call),
                    blockers: None,
                    retryable: None,
                    retry_ack_token: None,
                    validation: None,
                })
            }
            ExecutionState::Blocked { engine, blocker } => {
                let pending_key = engine.pending.clone().ok_or_else(|| {
                    ToolError::internal("blocked state has no pending step")
                })?;
                let recap = log.last_output_for(&parent_of(&log, &node.node_id));
                let context = effective_context(&log);
                let pending = self.render_pending_with_loop_vars(
                    &compiled,
                    &pending_key,
                    recap,
                    &context,
                )?;

                let retryable = blocker.kind == BlockSeverity::Retryable;
                // Terminal blocks mint no ack: there is nothing the agent
                // can acknowledge without user intervention.
                let retry_ack_token = if retryable {
                    Some(self.sign_ack(
                        &payload.session_id,
                        &node.run_id,
                        &node.node_id,
                        &node.attempt_id,
                    ))
                } else {
                    None
                };
                let next_call = match &retry_ack_token {
                    Some(ack) => Some(NextCall::continue_with(&state_token, Some(ack))),
                    None => Some(NextCall::rehydrate(&state_token)),
                };
                Ok(ContinueResponse {
                    kind: ContinueKind::Blocked,
                    state_token,
                    ack_token: None,
                    checkpoint_token: None,
                    pending: Some(pending),
                    is_complete: false,
                    preferences,
                    next_intent: if retryable {
                        NextIntent::PerformPendingThenContinue
                    } else {
                        NextIntent::RehydrateOnly
                    },
                    next_call,
                    blockers: Some(crate::advance::blocker_views(&blocker.blockers)),
                    retryable: Some(retryable),
                    retry_ack_token,
                    validation: None,
                })
            }
            ExecutionState::Init => Err(ToolError::internal(
                "stored snapshot holds an unselected init state",
            )),
        }
    }

    // ── Checkpoint ───────────────────────────────────────────────────

    pub fn checkpoint_workflow(
        &self,
        checkpoint_token: &str,
    ) -> Result<CheckpointResponse, ToolError> {
        let payload = self.tokens.verify_checkpoint(checkpoint_token)?;
        let session_path = session_dir(&self.data_dir, &payload.session_id);
        if !session_path.exists() {
            return Err(ToolError::not_found(format!(
                "session '{}' has no durable state",
                payload.session_id
            )));
        }

        let mut witness =
            open_session_healthy(&session_path, &payload.session_id, "checkpoint_workflow")?;
        let node = node_view(witness.state(), &payload.node_id)
            .ok_or_else(|| unknown_node(&payload.node_id))?;
        let compiled = self.load_pinned_workflow(&node.workflow_hash)?;
        let state_token =
            self.sign_state(&payload.session_id, &node.run_id, &node.node_id, &compiled);

        let dedupe = checkpoint_dedupe_key(&payload.session_id, &node.node_id, &payload.attempt_id);
        if let Some(recorded) = witness.state().event_by_dedupe_key(&dedupe) {
            // Idempotent: surface the recorded checkpoint.
            let EventBody::NodeCreated { node_id, .. } = &recorded.body else {
                return Err(ToolError::internal("checkpoint dedupe key on wrong event"));
            };
            return Ok(CheckpointResponse {
                checkpoint_node_id: node_id.clone(),
                state_token,
            });
        }

        let checkpoint_node = NodeId::mint();
        let checkpoint_attempt = payload.attempt_id.derive_checkpoint();
        let first_index = witness.state().next_event_index();
        let node_created = EventEnvelope::new(
            first_index,
            payload.session_id.clone(),
            Some(EventScope::node(node.run_id.clone(), checkpoint_node.clone())),
            dedupe,
            EventBody::NodeCreated {
                node_id: checkpoint_node.clone(),
                node_kind: NodeKind::Checkpoint,
                parent_node_id: Some(node.node_id.clone()),
                workflow_hash: node.workflow_hash,
                snapshot_ref: node.snapshot_ref,
                attempt_id: checkpoint_attempt,
            },
        );
        let edge = EventEnvelope::new(
            first_index + 1,
            payload.session_id.clone(),
            Some(EventScope::run(node.run_id.clone())),
            format!("edge:{}:{}", node.node_id, checkpoint_node),
            EventBody::EdgeCreated {
                from_node_id: node.node_id.clone(),
                to_node_id: checkpoint_node.clone(),
                cause: wr_store::EdgeCause::AckedStep,
            },
        );

        witness.append(AppendPlan {
            events: vec![node_created, edge],
            snapshot_pins: Vec::new(),
        })?;

        tracing::info!(
            session_id = %payload.session_id,
            checkpoint_node = %checkpoint_node,
            "checkpoint recorded"
        );

        Ok(CheckpointResponse {
            checkpoint_node_id: checkpoint_node,
            state_token,
        })
    }

    // ── Shared helpers ───────────────────────────────────────────────

    pub(crate) fn sign_state(
        &self,
        session_id: &SessionId,
        run_id: &RunId,
        node_id: &NodeId,
        compiled: &CompiledWorkflow,
    ) -> String {
        self.tokens.sign_state(&StatePayload {
            session_id: session_id.clone(),
            run_id: run_id.clone(),
            node_id: node_id.clone(),
            workflow_hash_ref: compiled.workflow_hash.hash_ref(),
        })
    }

    pub(crate) fn sign_ack(
        &self,
        session_id: &SessionId,
        run_id: &RunId,
        node_id: &NodeId,
        attempt_id: &AttemptId,
    ) -> String {
        self.tokens.sign_ack(&AckPayload {
            session_id: session_id.clone(),
            run_id: run_id.clone(),
            node_id: node_id.clone(),
            attempt_id: attempt_id.clone(),
        })
    }

    pub(crate) fn sign_checkpoint(
        &self,
        session_id: &SessionId,
        run_id: &RunId,
        node_id: &NodeId,
        attempt_id: &AttemptId,
    ) -> String {
        self.tokens.sign_checkpoint(&AckPayload {
            session_id: session_id.clone(),
            run_id: run_id.clone(),
            node_id: node_id.clone(),
            attempt_id: attempt_id.clone(),
        })
    }

    pub(crate) fn check_hash_ref(
        &self,
        payload: &StatePayload,
        node: &NodeView,
    ) -> Result<(), ToolError> {
        if payload.workflow_hash_ref.matches(&node.workflow_hash) {
            Ok(())
        } else {
            Err(ToolError::new(
                ToolErrorCode::TokenWorkflowHashMismatch,
                format!(
                    "token was minted for workflow {}, node is pinned to {}",
                    payload.workflow_hash_ref, node.workflow_hash
                ),
            ))
        }
    }

    pub(crate) fn load_pinned_workflow(
        &self,
        workflow_hash: &ContentDigest,
    ) -> Result<CompiledWorkflow, ToolError> {
        let value = self.snapshots.get(workflow_hash)?.ok_or_else(|| {
            ToolError::precondition(format!("pinned workflow {workflow_hash} is missing"))
        })?;
        Ok(CompiledWorkflow::from_pinned(value, *workflow_hash)?)
    }

    pub(crate) fn load_exec_snapshot(
        &self,
        snapshot_ref: &ContentDigest,
    ) -> Result<ExecutionSnapshot, ToolError> {
        let value = self.snapshots.get(snapshot_ref)?.ok_or_else(|| {
            ToolError::new(
                ToolErrorCode::SessionNotHealthy,
                format!("execution snapshot {snapshot_ref} is missing"),
            )
        })?;
        ExecutionSnapshot::from_value(value).map_err(|err| ToolError::internal(err.to_string()))
    }

    pub(crate) fn render_pending(
        &self,
        compiled: &CompiledWorkflow,
        key: &StepInstanceKey,
        recap: Option<&str>,
    ) -> Result<PendingStep, ToolError> {
        let leaf = compiled.leaf(&key.step_id).ok_or_else(|| {
            ToolError::internal(format!("pending step '{}' is not a leaf", key.step_id))
        })?;
        let mut prompt = leaf.prompt.clone();
        if let Some(recap) = recap {
            prompt = format!(
                "## Recovery\nA previous attempt at this step was blocked. \
                 The last recorded output was:\n\n{recap}\n\n{prompt}"
            );
        }
        Ok(PendingStep {
            step_id: leaf.id.clone(),
            title: leaf.title.clone(),
            prompt,
        })
    }

    /// Render a pending step, prefixing current forEach loop bindings so the
    /// agent knows which item it is working on.
    pub(crate) fn render_pending_with_loop_vars(
        &self,
        compiled: &CompiledWorkflow,
        key: &StepInstanceKey,
        recap: Option<&str>,
        context: &wr_workflow::Context,
    ) -> Result<PendingStep, ToolError> {
        let mut pending = self.render_pending(compiled, key, recap)?;
        for entry in &key.loop_path {
            let Some(loop_step) = compiled.loop_config(&entry.loop_id) else {
                continue;
            };
            if loop_step.kind != LoopKind::ForEach {
                continue;
            }
            let Some(items_var) = loop_step.items.as_deref() else {
                continue;
            };
            let item = context
                .get(items_var)
                .and_then(Value::as_array)
                .and_then(|items| items.get(entry.iteration as usize));
            if let Some(item) = item {
                let item_name = loop_step.item_var.as_deref().unwrap_or("item");
                let index_name = loop_step.index_var.as_deref().unwrap_or("index");
                pending.prompt = format!(
                    "## Loop binding\n{item_name} = {item}\n{index_name} = {}\n\n{}",
                    entry.iteration, pending.prompt
                );
            }
        }
        Ok(pending)
    }

    pub(crate) fn push_gap_events(
        &self,
        compiled: &CompiledWorkflow,
        effective: Preferences,
        session_id: &SessionId,
        base_index: u64,
        events: &mut Vec<EventEnvelope>,
    ) {
        let Some(recommended) = compiled.body.recommended_preferences else {
            return;
        };
        for field in effective.exceeds(&recommended) {
            let index = base_index + events.len() as u64;
            events.push(EventEnvelope::new(
                index,
                session_id.clone(),
                None,
                format!("gap:{session_id}:{index}"),
                EventBody::GapRecorded {
                    severity: wr_store::GapSeverity::Warning,
                    message: format!(
                        "effective {field} exceeds the workflow's recommendation"
                    ),
                },
            ));
        }
    }
}

pub(crate) fn unknown_node(node_id: &NodeId) -> ToolError {
    ToolError::new(
        ToolErrorCode::TokenUnknownNode,
        format!("node '{node_id}' is not recorded in this session"),
    )
}

/// Children that represent execution progress. Checkpoint nodes hang off
/// their parent but never make it a fork point.
pub(crate) fn advance_children(log: &SessionLogState, node_id: &NodeId) -> Vec<NodeId> {
    log.children_of(node_id)
        .iter()
        .filter(|child| {
            node_view(log, child)
                .map(|view| view.node_kind != NodeKind::Checkpoint)
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Parent node of `node_id`, falling back to the node itself for roots.
pub(crate) fn parent_of(log: &SessionLogState, node_id: &NodeId) -> NodeId {
    log.node_created(node_id)
        .and_then(|event| match &event.body {
            EventBody::NodeCreated { parent_node_id, .. } => parent_node_id.clone(),
            _ => None,
        })
        .unwrap_or_else(|| node_id.clone())
}

pub(crate) fn preferences_from_context(
    context: &wr_workflow::Context,
) -> Result<Option<Preferences>, ToolError> {
    let Some(value) = context.get("preferences") else {
        return Ok(None);
    };
    serde_json::from_value(value.clone())
        .map(Some)
        .map_err(|err| {
            ToolError::validation(format!("context.preferences is malformed: {err}"))
        })
}

fn validate_declared_intent(intent: &str) -> Result<(), ToolError> {
    match intent {
        "perform_pending_then_continue" | "await_user_confirmation" | "rehydrate_only"
        | "complete" => Ok(()),
        other => Err(ToolError::validation(format!(
            "intent '{other}' is not in the supported set"
        ))),
    }
}

/// Truncate output to the stored bound without splitting a UTF-8 boundary.
pub(crate) fn bounded_markdown(output: &str) -> String {
    if output.len() <= NODE_OUTPUT_LIMIT_BYTES {
        return output.to_string();
    }
    let mut end = NODE_OUTPUT_LIMIT_BYTES;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    output[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_markdown_respects_char_boundaries() {
        let ascii = "a".repeat(NODE_OUTPUT_LIMIT_BYTES + 100);
        assert_eq!(bounded_markdown(&ascii).len(), NODE_OUTPUT_LIMIT_BYTES);

        let wide = "é".repeat(NODE_OUTPUT_LIMIT_BYTES);
        let bounded = bounded_markdown(&wide);
        assert!(bounded.len() <= NODE_OUTPUT_LIMIT_BYTES);
        assert!(std::str::from_utf8(bounded.as_bytes()).is_ok());
    }

    #[test]
    fn test_short_output_passes_through() {
        assert_eq!(bounded_markdown("done"), "done");
    }

    #[test]
    fn test_declared_intent_validation() {
        assert!(validate_declared_intent("complete").is_ok());
        assert!(validate_declared_intent("perform_pending_then_continue").is_ok());
        assert!(validate_declared_intent("do_whatever").is_err());
    }
}
