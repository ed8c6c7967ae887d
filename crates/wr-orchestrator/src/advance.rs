//! The advance core: validate output, step the interpreter, plan events,
//! and append atomically. Recorded attempts replay from durable facts.

use crate::context_budget::validate_context;
use crate::error::ToolError;
use crate::exec_snapshot::ExecutionSnapshot;
use crate::orchestrator::{
    ContinueRequest, NodeView, Orchestrator, advance_children, bounded_markdown, node_view,
    preferences_from_context, unknown_node,
};
use crate::projection::{effective_context, effective_preferences};
use crate::response::{
    BlockerView, ContinueKind, ContinueResponse, NextCall, NextIntent,
};
use serde_json::Value;
use std::path::Path;
use wr_core::{AttemptId, NodeId, SessionId};
use wr_engine::{
    BlockSeverity, BlockerEntry, BlockerRecord, EngineEvent, ExecutionState, RunningState,
    StepInstanceKey, apply_event,
};
use wr_store::{
    AdvanceOutcome, AppendPlan, Blocker, BlockerKind, EdgeCause, EventBody, EventEnvelope,
    EventScope, HealthySessionLock, NodeKind, SessionLogState, SnapshotPin, advance_dedupe_key,
    open_session_healthy,
};
use wr_token::{AckPayload, StatePayload};
use wr_validate::{ValidationReport, evaluate_criteria, validate_output_contract};
use wr_workflow::{Artifact, CompiledWorkflow, Context};

fn push_event(
    events: &mut Vec<EventEnvelope>,
    base: u64,
    session_id: &SessionId,
    scope: Option<EventScope>,
    dedupe: String,
    body: EventBody,
) -> u64 {
    let index = base + events.len() as u64;
    events.push(EventEnvelope::new(index, session_id.clone(), scope, dedupe, body));
    index
}

impl Orchestrator {
    pub(crate) fn advance(
        &self,
        session_path: &Path,
        state_payload: &StatePayload,
        ack_payload: &AckPayload,
        request: &ContinueRequest,
    ) -> Result<ContinueResponse, ToolError> {
        let mut witness =
            open_session_healthy(session_path, &state_payload.session_id, "continue_workflow")?;
        let node = node_view(witness.state(), &state_payload.node_id)
            .ok_or_else(|| unknown_node(&state_payload.node_id))?;
        self.check_hash_ref(state_payload, &node)?;

        let compiled = self.load_pinned_workflow(&node.workflow_hash)?;
        let dedupe = advance_dedupe_key(
            &state_payload.session_id,
            &node.node_id,
            &ack_payload.attempt_id,
        );

        if witness.state().contains_dedupe_key(&dedupe) {
            // Fact-returning replay: the lock is not needed for projection.
            let log = witness.state().clone();
            drop(witness);
            tracing::debug!(
                session_id = %state_payload.session_id,
                node_id = %node.node_id,
                "advance replayed from recorded outcome"
            );
            return self.replay(&log, &compiled, &node, &dedupe);
        }

        let snapshot = self.load_exec_snapshot(&node.snapshot_ref)?;
        let (engine, mode) = route_advance(&node, &snapshot)?;

        let patch = request
            .context
            .as_ref()
            .map(validate_context)
            .transpose()?;
        let mut context = effective_context(witness.state());
        if let Some(patch) = &patch {
            for (key, value) in patch {
                context.insert(key.clone(), value.clone());
            }
        }

        let pending_key = engine.pending.clone().ok_or_else(|| {
            ToolError::internal("advance source state has no pending step")
        })?;
        let output = request.output.clone().unwrap_or_default();

        let checked = self.check_output(&compiled, &pending_key, &output, &context)?;
        let mut artifacts = snapshot.artifacts.clone();
        if let Some(artifact) = checked.artifact.clone() {
            artifacts.push(artifact);
        }

        let cause = derive_cause(witness.state(), &node, &ack_payload.attempt_id);
        if checked.blockers.is_empty() {
            self.advance_success(
                &mut witness,
                &compiled,
                &node,
                ack_payload,
                engine,
                pending_key,
                context,
                patch,
                artifacts,
                &output,
                checked.report,
                cause,
                mode,
            )
        } else {
            self.advance_blocked(
                &mut witness,
                &compiled,
                &node,
                ack_payload,
                engine,
                pending_key,
                snapshot.artifacts,
                &output,
                checked,
                cause,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn advance_success(
        &self,
        witness: &mut HealthySessionLock,
        compiled: &CompiledWorkflow,
        node: &NodeView,
        ack_payload: &AckPayload,
        engine: RunningState,
        pending_key: StepInstanceKey,
        context: Context,
        patch: Option<Context>,
        artifacts: Vec<Artifact>,
        output: &str,
        report: Option<ValidationReport>,
        cause: EdgeCause,
        mode: AdvanceMode,
    ) -> Result<ContinueResponse, ToolError> {
        let session_id = witness.state().session_id().clone();

        let after = apply_event(
            &ExecutionState::Running(engine),
            &EngineEvent::StepCompleted {
                step_instance_key: pending_key.clone(),
            },
        )?;
        // Interpreter failures (missing context or artifact) surface before
        // anything is written.
        let outcome = wr_engine::next(compiled, &after, &context, &artifacts)?;

        let new_node = NodeId::mint();
        let new_attempt = ack_payload.attempt_id.derive_next();
        let new_snapshot = ExecutionSnapshot {
            engine_state: outcome.state.clone(),
            artifacts,
            workflow_hash: compiled.workflow_hash,
        };
        let snapshot_value = new_snapshot
            .to_value()
            .map_err(|err| ToolError::internal(err.to_string()))?;
        let snapshot_ref = self.snapshots.put(&snapshot_value)?;

        let mut events = Vec::new();
        let base = witness.state().next_event_index();

        push_event(
            &mut events,
            base,
            &session_id,
            Some(EventScope::node(node.run_id.clone(), node.node_id.clone())),
            advance_dedupe_key(&session_id, &node.node_id, &ack_payload.attempt_id),
            EventBody::AdvanceRecorded {
                attempt_id: ack_payload.attempt_id.clone(),
                cause,
                outcome: AdvanceOutcome::Advanced {
                    to_node_id: new_node.clone(),
                },
            },
        );
        let node_created_index = push_event(
            &mut events,
            base,
            &session_id,
            Some(EventScope::node(node.run_id.clone(), new_node.clone())),
            format!("node_created:{new_node}"),
            EventBody::NodeCreated {
                node_id: new_node.clone(),
                node_kind: NodeKind::Step,
                parent_node_id: Some(node.node_id.clone()),
                workflow_hash: compiled.workflow_hash,
                snapshot_ref,
                attempt_id: new_attempt.clone(),
            },
        );
        push_event(
            &mut events,
            base,
            &session_id,
            Some(EventScope::run(node.run_id.clone())),
            format!("edge:{}:{new_node}", node.node_id),
            EventBody::EdgeCreated {
                from_node_id: node.node_id.clone(),
                to_node_id: new_node.clone(),
                cause,
            },
        );
        if !output.is_empty() {
            let index = base + events.len() as u64;
            push_event(
                &mut events,
                base,
                &session_id,
                Some(EventScope::node(node.run_id.clone(), node.node_id.clone())),
                format!("node_output:{session_id}:{index}"),
                EventBody::NodeOutputAppended {
                    markdown: bounded_markdown(output),
                },
            );
        }
        if let Some(report) = &report {
            let index = base + events.len() as u64;
            push_event(
                &mut events,
                base,
                &session_id,
                Some(EventScope::node(node.run_id.clone(), node.node_id.clone())),
                format!("validation:{session_id}:{index}"),
                EventBody::ValidationRecorded {
                    step_id: pending_key.step_id.clone(),
                    valid: report.valid,
                    issues: report.issues.clone(),
                    suggestions: report.suggestions.clone(),
                },
            );
        }
        let mut preferences = effective_preferences(witness.state());
        if let Some(patch) = &patch {
            let index = base + events.len() as u64;
            push_event(
                &mut events,
                base,
                &session_id,
                None,
                format!("context_set:{session_id}:{index}"),
                EventBody::ContextSet {
                    patch: Value::Object(patch.clone()),
                },
            );
            if let Some(capabilities) = patch.get("capabilities").and_then(Value::as_object) {
                for (name, value) in capabilities {
                    let index = base + events.len() as u64;
                    push_event(
                        &mut events,
                        base,
                        &session_id,
                        Some(EventScope::node(node.run_id.clone(), node.node_id.clone())),
                        format!("capability:{}:{name}:{index}", node.node_id),
                        EventBody::CapabilityObserved {
                            name: name.clone(),
                            value: value.clone(),
                        },
                    );
                }
            }
            if let Some(requested) = preferences_from_context(patch)? {
                preferences = requested;
                let index = base + events.len() as u64;
                push_event(
                    &mut events,
                    base,
                    &session_id,
                    None,
                    format!("preferences_changed:{session_id}:{index}"),
                    EventBody::PreferencesChanged {
                        preferences: requested,
                    },
                );
            }
        }

        // Gap events compare against the pinned workflow's recommendation.
        self.push_gap_events(compiled, preferences, &session_id, base, &mut events);

        let node_created_id = events
            .iter()
            .find(|event| event.event_index == node_created_index)
            .map(|event| event.event_id.clone())
            .ok_or_else(|| ToolError::internal("node_created event missing from plan"))?;

        witness.append(AppendPlan {
            events,
            snapshot_pins: vec![SnapshotPin {
                snapshot_ref,
                event_index: node_created_index,
                created_by_event_id: node_created_id,
            }],
        })?;

        tracing::info!(
            session_id = %session_id,
            from = %node.node_id,
            to = %new_node,
            cause = ?cause,
            mode = ?mode,
            is_complete = outcome.is_complete,
            "advance recorded"
        );

        let state_token = self.sign_state(&session_id, &node.run_id, &new_node, compiled);
        let pending = outcome
            .next
            .as_ref()
            .map(|key| self.render_pending_with_loop_vars(compiled, key, None, &context))
            .transpose()?;
        let (ack_token, checkpoint_token) = if pending.is_some() {
            (
                Some(self.sign_ack(&session_id, &node.run_id, &new_node, &new_attempt)),
                Some(self.sign_checkpoint(&session_id, &node.run_id, &new_node, &new_attempt)),
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
            Some(ack) => Some(NextCall::continue_with(&state_token, Some(ack))),
            None => None,
        };

        Ok(ContinueResponse {
            kind: ContinueKind::Ok,
            state_token,
            ack_token,
            checkpoint_token,
            pending,
            is_complete: outcome.is_complete,
            preferences,
            next_intent,
            next_call,
            blockers: None,
            retryable: None,
            retry_ack_token: None,
            validation: report,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn advance_blocked(
        &self,
        witness: &mut HealthySessionLock,
        compiled: &CompiledWorkflow,
        node: &NodeView,
        ack_payload: &AckPayload,
        engine: RunningState,
        pending_key: StepInstanceKey,
        artifacts: Vec<Artifact>,
        output: &str,
        checked: CheckedOutput,
        cause: EdgeCause,
    ) -> Result<ContinueResponse, ToolError> {
        let session_id = witness.state().session_id().clone();
        let blocked_node = NodeId::mint();
        let blocked_attempt = ack_payload.attempt_id.derive_next();
        let retryable = checked.severity == BlockSeverity::Retryable;

        let blocker_record = BlockerRecord {
            kind: checked.severity,
            blockers: checked.blockers.clone(),
            retry_attempt_id: retryable.then(|| blocked_attempt.as_str().to_string()),
            validation_ref: None,
        };
        let blocked_snapshot = ExecutionSnapshot {
            engine_state: ExecutionState::Blocked {
                engine,
                blocker: blocker_record,
            },
            artifacts,
            workflow_hash: compiled.workflow_hash,
        };
        let snapshot_value = blocked_snapshot
            .to_value()
            .map_err(|err| ToolError::internal(err.to_string()))?;
        let snapshot_ref = self.snapshots.put(&snapshot_value)?;

        let store_blockers: Vec<Blocker> = checked
            .blockers
            .iter()
            .map(|entry| Blocker {
                code: entry.code.clone(),
                message: entry.message.clone(),
                suggestion: entry.suggestion.clone(),
            })
            .collect();

        let base = witness.state().next_event_index();
        let mut events = Vec::new();

        push_event(
            &mut events,
            base,
            &session_id,
            Some(EventScope::node(node.run_id.clone(), node.node_id.clone())),
            advance_dedupe_key(&session_id, &node.node_id, &ack_payload.attempt_id),
            EventBody::AdvanceRecorded {
                attempt_id: ack_payload.attempt_id.clone(),
                cause,
                outcome: AdvanceOutcome::Blocked {
                    to_node_id: blocked_node.clone(),
                    blocker_kind: if retryable {
                        BlockerKind::Retryable
                    } else {
                        BlockerKind::Terminal
                    },
                    blockers: store_blockers,
                    validation_ref: None,
                },
            },
        );
        let node_created_index = push_event(
            &mut events,
            base,
            &session_id,
            Some(EventScope::node(node.run_id.clone(), blocked_node.clone())),
            format!("node_created:{blocked_node}"),
            EventBody::NodeCreated {
                node_id: blocked_node.clone(),
                node_kind: NodeKind::BlockedAttempt,
                parent_node_id: Some(node.node_id.clone()),
                workflow_hash: compiled.workflow_hash,
                snapshot_ref,
                attempt_id: blocked_attempt.clone(),
            },
        );
        push_event(
            &mut events,
            base,
            &session_id,
            Some(EventScope::run(node.run_id.clone())),
            format!("edge:{}:{blocked_node}", node.node_id),
            EventBody::EdgeCreated {
                from_node_id: node.node_id.clone(),
                to_node_id: blocked_node.clone(),
                cause,
            },
        );
        if !output.is_empty() {
            let index = base + events.len() as u64;
            push_event(
                &mut events,
                base,
                &session_id,
                Some(EventScope::node(node.run_id.clone(), node.node_id.clone())),
                format!("node_output:{session_id}:{index}"),
                EventBody::NodeOutputAppended {
                    markdown: bounded_markdown(output),
                },
            );
        }
        if let Some(report) = &checked.report {
            let index = base + events.len() as u64;
            push_event(
                &mut events,
                base,
                &session_id,
                Some(EventScope::node(node.run_id.clone(), node.node_id.clone())),
                format!("validation:{session_id}:{index}"),
                EventBody::ValidationRecorded {
                    step_id: pending_key.step_id.clone(),
                    valid: report.valid,
                    issues: report.issues.clone(),
                    suggestions: report.suggestions.clone(),
                },
            );
        }

        let node_created_id = events
            .iter()
            .find(|event| event.event_index == node_created_index)
            .map(|event| event.event_id.clone())
            .ok_or_else(|| ToolError::internal("node_created event missing from plan"))?;

        witness.append(AppendPlan {
            events,
            snapshot_pins: vec![SnapshotPin {
                snapshot_ref,
                event_index: node_created_index,
                created_by_event_id: node_created_id,
            }],
        })?;

        tracing::info!(
            session_id = %session_id,
            from = %node.node_id,
            blocked_node = %blocked_node,
            retryable,
            "advance blocked"
        );

        let context = effective_context(witness.state());
        let preferences = effective_preferences(witness.state());
        let state_token = self.sign_state(&session_id, &node.run_id, &blocked_node, compiled);
        let pending =
            self.render_pending_with_loop_vars(compiled, &pending_key, None, &context)?;
        let retry_ack_token = retryable.then(|| {
            self.sign_ack(&session_id, &node.run_id, &blocked_node, &blocked_attempt)
        });
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
                NextIntent::AwaitUserConfirmation
            },
            next_call,
            blockers: Some(blocker_views(&checked.blockers)),
            retryable: Some(retryable),
            retry_ack_token,
            validation: checked.report,
        })
    }

    /// Reproduce a recorded advance from durable facts only. Engine state is
    /// never recomputed; tokens re-mint deterministically from recorded
    /// attempt ids.
    fn replay(
        &self,
        log: &SessionLogState,
        compiled: &CompiledWorkflow,
        node: &NodeView,
        dedupe: &str,
    ) -> Result<ContinueResponse, ToolError> {
        let recorded = log
            .event_by_dedupe_key(dedupe)
            .ok_or_else(|| ToolError::internal("replay key vanished from the log"))?;
        let EventBody::AdvanceRecorded { outcome, .. } = &recorded.body else {
            return Err(ToolError::internal("advance dedupe key on wrong event"));
        };
        let session_id = log.session_id().clone();
        let context = effective_context(log);
        let preferences = effective_preferences(log);
        let validation = validation_after(log, recorded.event_index, &node.node_id);

        match outcome {
            AdvanceOutcome::Advanced { to_node_id } => {
                let to = node_view(log, to_node_id)
                    .ok_or_else(|| ToolError::internal("advanced-to node is unrecorded"))?;
                let snapshot = self.load_exec_snapshot(&to.snapshot_ref)?;
                let state_token = self.sign_state(&session_id, &to.run_id, &to.node_id, compiled);

                let (pending, is_complete) = match &snapshot.engine_state {
                    ExecutionState::Complete => (None, true),
                    ExecutionState::Running(running) => {
                        let key = running.pending.clone().ok_or_else(|| {
                            ToolError::internal("stored running state has no pending step")
                        })?;
                        (
                            Some(self.render_pending_with_loop_vars(
                                compiled, &key, None, &context,
                            )?),
                            false,
                        )
                    }
                    _ => return Err(ToolError::internal("advanced-to snapshot is not ok")),
                };

                let (ack_token, checkpoint_token) = if pending.is_some() {
                    (
                        Some(self.sign_ack(&session_id, &to.run_id, &to.node_id, &to.attempt_id)),
                        Some(self.sign_checkpoint(
                            &session_id,
                            &to.run_id,
                            &to.node_id,
                            &to.attempt_id,
                        )),
                    )
                } else {
                    (None, None)
                };
                let next_intent = if is_complete {
                    NextIntent::Complete
                } else {
                    NextIntent::PerformPendingThenContinue
                };
                let next_call = ack_token
                    .as_ref()
                    .map(|ack| NextCall::continue_with(&state_token, Some(ack)));

                Ok(ContinueResponse {
                    kind: ContinueKind::Ok,
                    state_token,
                    ack_token,
                    checkpoint_token,
                    pending,
                    is_complete,
                    preferences,
                    next_intent,
                    next_call,
                    blockers: None,
                    retryable: None,
                    retry_ack_token: None,
                    validation,
                })
            }
            AdvanceOutcome::Blocked {
                to_node_id,
                blocker_kind,
                blockers,
                ..
            } => {
                let to = node_view(log, to_node_id)
                    .ok_or_else(|| ToolError::internal("blocked-to node is unrecorded"))?;
                let snapshot = self.load_exec_snapshot(&to.snapshot_ref)?;
                let ExecutionState::Blocked { engine, .. } = &snapshot.engine_state else {
                    return Err(ToolError::internal("blocked-to snapshot is not blocked"));
                };
                let pending_key = engine.pending.clone().ok_or_else(|| {
                    ToolError::internal("blocked state has no pending step")
                })?;

                let retryable = *blocker_kind == BlockerKind::Retryable;
                let state_token = self.sign_state(&session_id, &to.run_id, &to.node_id, compiled);
                let pending = self.render_pending_with_loop_vars(
                    compiled,
                    &pending_key,
                    None,
                    &context,
                )?;
                let retry_ack_token = retryable.then(|| {
                    self.sign_ack(&session_id, &to.run_id, &to.node_id, &to.attempt_id)
                });
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
                        NextIntent::AwaitUserConfirmation
                    },
                    next_call,
                    blockers: Some(
                        blockers
                            .iter()
                            .map(|blocker| BlockerView {
                                code: blocker.code.clone(),
                                message: blocker.message.clone(),
                                suggestion: blocker.suggestion.clone(),
                            })
                            .collect(),
                    ),
                    retryable: Some(retryable),
                    retry_ack_token,
                    validation,
                })
            }
        }
    }

    /// Validate output against the pending step's contract and criteria.
    fn check_output(
        &self,
        compiled: &CompiledWorkflow,
        pending_key: &StepInstanceKey,
        output: &str,
        context: &Context,
    ) -> Result<CheckedOutput, ToolError> {
        let leaf = compiled.leaf(&pending_key.step_id).ok_or_else(|| {
            ToolError::internal(format!(
                "pending step '{}' is not a leaf",
                pending_key.step_id
            ))
        })?;

        let mut checked = CheckedOutput::default();

        if let Some(contract_id) = &leaf.output_contract {
            let contract = self.contracts.get(contract_id).ok_or_else(|| {
                ToolError::internal(format!("contract '{contract_id}' vanished after compile"))
            })?;
            let outcome = validate_output_contract(contract, output)?;
            if outcome.report.valid {
                checked.artifact = outcome.artifact;
            } else {
                for issue in &outcome.report.issues {
                    checked.blockers.push(BlockerEntry {
                        code: "output_contract_violation".to_string(),
                        message: issue.clone(),
                        suggestion: outcome.report.suggestions.first().cloned(),
                    });
                }
            }
            checked.merge_report(outcome.report);
        }

        if let Some(criteria) = &leaf.validation_criteria {
            match evaluate_criteria(criteria, output, context) {
                Ok(report) => {
                    if !report.valid {
                        for issue in &report.issues {
                            checked.blockers.push(BlockerEntry {
                                code: "validation_failed".to_string(),
                                message: issue.clone(),
                                suggestion: report.suggestions.first().cloned(),
                            });
                        }
                    }
                    checked.merge_report(report);
                }
                Err(err) => {
                    // Malformed criteria are an authoring defect the agent
                    // cannot repair: block terminally.
                    checked.severity = BlockSeverity::Terminal;
                    checked.blockers.push(BlockerEntry {
                        code: match &err {
                            wr_validate::ValidationError::SchemaCompilationFailed { .. } => {
                                "schema_compilation_failed".to_string()
                            }
                            wr_validate::ValidationError::InvalidCriteriaFormat { .. } => {
                                "invalid_criteria_format".to_string()
                            }
                            wr_validate::ValidationError::EvaluationThrew { .. } => {
                                "evaluation_threw".to_string()
                            }
                        },
                        message: err.to_string(),
                        suggestion: Some(
                            "the workflow definition needs fixing; ask the user".to_string(),
                        ),
                    });
                }
            }
        }

        Ok(checked)
    }
}

/// How an advance entered the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdvanceMode {
    Fresh,
    Retry,
}

fn route_advance(
    node: &NodeView,
    snapshot: &ExecutionSnapshot,
) -> Result<(RunningState, AdvanceMode), ToolError> {
    match &snapshot.engine_state {
        ExecutionState::Running(running) if running.pending.is_some() => {
            Ok((running.clone(), AdvanceMode::Fresh))
        }
        ExecutionState::Blocked { engine, blocker } => {
            if node.node_kind != NodeKind::BlockedAttempt {
                return Err(ToolError::internal(
                    "blocked snapshot on a non-blocked node",
                ));
            }
            match blocker.kind {
                BlockSeverity::Retryable => Ok((engine.clone(), AdvanceMode::Retry)),
                BlockSeverity::Terminal => Err(ToolError::precondition(
                    "this attempt is terminally blocked; user intervention is required",
                )
                .with_suggestion("resolve the blockers, then start or fork a new attempt")),
            }
        }
        ExecutionState::Complete => Err(ToolError::precondition(
            "the run is complete; nothing can be advanced",
        )),
        ExecutionState::Init | ExecutionState::Running(_) => Err(ToolError::internal(
            "stored snapshot is not advanceable",
        )),
    }
}

/// Fork cause, fixed at record time.
fn derive_cause(log: &SessionLogState, node: &NodeView, presented: &AttemptId) -> EdgeCause {
    let children = advance_children(log, &node.node_id);
    if children.is_empty() {
        EdgeCause::AckedStep
    } else if presented == &node.attempt_id {
        EdgeCause::NonTipAdvance
    } else {
        EdgeCause::IntentionalFork
    }
}

/// The validation recorded alongside a given advance, if any.
fn validation_after(
    log: &SessionLogState,
    advance_index: u64,
    node_id: &NodeId,
) -> Option<ValidationReport> {
    log.events()
        .iter()
        .skip(advance_index as usize)
        .take_while(|event| {
            event.event_index == advance_index
                || !matches!(event.body, EventBody::AdvanceRecorded { .. })
        })
        .find_map(|event| match &event.body {
            EventBody::ValidationRecorded {
                valid,
                issues,
                suggestions,
                ..
            } if event.scope.as_ref().and_then(|s| s.node_id.as_ref()) == Some(node_id) => {
                Some(ValidationReport {
                    valid: *valid,
                    issues: issues.clone(),
                    suggestions: suggestions.clone(),
                    warnings: Vec::new(),
                })
            }
            _ => None,
        })
}

pub(crate) fn blocker_views(blockers: &[BlockerEntry]) -> Vec<BlockerView> {
    blockers
        .iter()
        .map(|entry| BlockerView {
            code: entry.code.clone(),
            message: entry.message.clone(),
            suggestion: entry.suggestion.clone(),
        })
        .collect()
}

/// Outcome of output checking, before it becomes events.
#[derive(Debug, Clone)]
struct CheckedOutput {
    blockers: Vec<BlockerEntry>,
    severity: BlockSeverity,
    artifact: Option<Artifact>,
    report: Option<ValidationReport>,
}

impl Default for CheckedOutput {
    fn default() -> Self {
        // Retryable unless malformed criteria escalate to terminal.
        Self {
            blockers: Vec::new(),
            severity: BlockSeverity::Retryable,
            artifact: None,
            report: None,
        }
    }
}

impl CheckedOutput {
    fn merge_report(&mut self, incoming: ValidationReport) {
        match &mut self.report {
            None => self.report = Some(incoming),
            Some(existing) => {
                existing.valid = existing.valid && incoming.valid;
                existing.issues.extend(incoming.issues);
                existing.suggestions.extend(incoming.suggestions);
                existing.warnings.extend(incoming.warnings);
            }
        }
    }
}
