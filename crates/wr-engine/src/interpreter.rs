//! Pure next-step selection.
//!
//! `next` is a function of (compiled workflow, execution state, context,
//! artifacts) and nothing else: no I/O, no clocks, no logging. Determinism
//! here is what makes fact-based replay possible upstream.

use crate::state::{ExecutionState, LoopFrame, LoopPathEntry, RunningState, StepInstanceKey};
use serde_json::Value;
use wr_workflow::{
    Artifact, CompiledLoop, CompiledStep, CompiledWorkflow, ConditionGuidance, ConditionSource,
    Context, CountSource, LoopDecision, LoopKind, evaluate_with_guidance,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InterpreterError {
    #[error("context variable '{name}' is required but missing")]
    MissingContextVariable { name: String },

    #[error("context variable '{name}' must be an array for forEach")]
    ItemsNotAnArray { name: String },

    #[error("loop '{loop_id}' requires a '{contract}' artifact for this loop before advancing")]
    MissingLoopArtifact { loop_id: String, contract: String },

    #[error("loop '{loop_id}' has no condition source; the workflow cannot decide continuation")]
    MissingConditionSource { loop_id: String },

    #[error("compiled workflow has no step '{step_id}'")]
    UnknownStep { step_id: String },

    #[error("operation '{operation}' does not apply to state '{state}'")]
    InvalidStateKind {
        operation: &'static str,
        state: &'static str,
    },
}

/// Kinds of trace entries emitted during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    EnteredLoop,
    ExitedLoop,
    EvaluatedCondition,
    SelectedNextStep,
    LoopMaxIterationsReached,
    Blocked,
}

/// One entry of the selection trace.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub kind: TraceKind,
    pub summary: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl TraceEntry {
    fn new(kind: TraceKind, summary: impl Into<String>) -> Self {
        Self {
            kind,
            summary: summary.into(),
            detail: None,
        }
    }

    fn with_detail(kind: TraceKind, summary: impl Into<String>, detail: Value) -> Self {
        Self {
            kind,
            summary: summary.into(),
            detail: Some(detail),
        }
    }
}

/// Result of one `next` call.
#[derive(Debug, Clone, PartialEq)]
pub struct NextOutcome {
    pub state: ExecutionState,
    pub next: Option<StepInstanceKey>,
    pub is_complete: bool,
    pub trace: Vec<TraceEntry>,

    /// Guidance for conditions that did not hold during selection.
    pub guidance: Vec<ConditionGuidance>,
}

/// Select the next pending step, or report completion.
pub fn next(
    compiled: &CompiledWorkflow,
    state: &ExecutionState,
    context: &Context,
    artifacts: &[Artifact],
) -> Result<NextOutcome, InterpreterError> {
    let running = match state {
        ExecutionState::Complete => {
            return Ok(NextOutcome {
                state: ExecutionState::Complete,
                next: None,
                is_complete: true,
                trace: Vec::new(),
                guidance: Vec::new(),
            });
        }
        ExecutionState::Blocked { .. } => {
            return Err(InterpreterError::InvalidStateKind {
                operation: "next",
                state: "blocked",
            });
        }
        ExecutionState::Init => RunningState::default(),
        ExecutionState::Running(running) => running.clone(),
    };

    Selection {
        compiled,
        context,
        artifacts,
        trace: Vec::new(),
        guidance: Vec::new(),
    }
    .run(running)
}

struct Selection<'a> {
    compiled: &'a CompiledWorkflow,
    context: &'a Context,
    artifacts: &'a [Artifact],
    trace: Vec<TraceEntry>,
    guidance: Vec<ConditionGuidance>,
}

impl<'a> Selection<'a> {
    fn run(mut self, mut running: RunningState) -> Result<NextOutcome, InterpreterError> {
        if let Some(pending) = running.pending.clone() {
            self.trace.push(TraceEntry::new(
                TraceKind::SelectedNextStep,
                format!("pending step {pending} is unchanged"),
            ));
            return Ok(self.into_outcome_running(running, pending));
        }

        loop {
            if !running.loop_stack.is_empty() {
                match self.select_in_loop(&mut running)? {
                    Some(key) => return Ok(self.into_outcome_running(running, key)),
                    None => continue,
                }
            }

            match self.select_top_level(&mut running)? {
                TopLevelOutcome::Selected(key) => {
                    return Ok(self.into_outcome_running(running, key));
                }
                TopLevelOutcome::EnteredLoop => continue,
                TopLevelOutcome::Exhausted => {
                    return Ok(NextOutcome {
                        state: ExecutionState::Complete,
                        next: None,
                        is_complete: true,
                        trace: self.trace,
                        guidance: self.guidance,
                    });
                }
            }
        }
    }

    fn into_outcome_running(self, mut running: RunningState, key: StepInstanceKey) -> NextOutcome {
        running.pending = Some(key.clone());
        NextOutcome {
            state: ExecutionState::Running(running),
            next: Some(key),
            is_complete: false,
            trace: self.trace,
            guidance: self.guidance,
        }
    }

    /// Select within the current loop body, or end the iteration.
    /// Returns `None` when the loop made progress (iterated or exited) and
    /// selection should continue.
    fn select_in_loop(
        &mut self,
        running: &mut RunningState,
    ) -> Result<Option<StepInstanceKey>, InterpreterError> {
        let compiled = self.compiled;
        // Invariant: called with a non-empty stack.
        let frame = running.loop_stack.last().cloned().ok_or(
            InterpreterError::InvalidStateKind {
                operation: "select_in_loop",
                state: "running",
            },
        )?;
        let loop_step = self.loop_config(&frame.loop_id)?;
        let loop_path: Vec<LoopPathEntry> = running
            .loop_stack
            .iter()
            .map(|f| LoopPathEntry {
                loop_id: f.loop_id.clone(),
                iteration: f.iteration,
            })
            .collect();

        for (offset, step_id) in loop_step.body[frame.body_index..].iter().enumerate() {
            let key = StepInstanceKey::in_loops(step_id.clone(), loop_path.clone());
            if running.completed.contains(&key) {
                continue;
            }
            let step = compiled
                .step(step_id)
                .ok_or_else(|| InterpreterError::UnknownStep {
                    step_id: step_id.clone(),
                })?;
            if !self.run_condition_holds(step) {
                continue;
            }
            if let Some(frame) = running.loop_stack.last_mut() {
                frame.body_index += offset;
            }
            self.trace.push(TraceEntry::new(
                TraceKind::SelectedNextStep,
                format!("selected {key} in loop '{}'", loop_step.id),
            ));
            return Ok(Some(key));
        }

        // Fell off the end of the body: evaluate continuation.
        self.end_iteration(running, loop_step, frame.iteration)?;
        Ok(None)
    }

    fn end_iteration(
        &mut self,
        running: &mut RunningState,
        loop_step: &CompiledLoop,
        iteration: u32,
    ) -> Result<(), InterpreterError> {
        let next_iteration = iteration + 1;

        let exit = |this: &mut Self, running: &mut RunningState, entry: TraceEntry| {
            this.trace.push(entry);
            running.loop_stack.pop();
            let outer_path: Vec<LoopPathEntry> = running
                .loop_stack
                .iter()
                .map(|f| LoopPathEntry {
                    loop_id: f.loop_id.clone(),
                    iteration: f.iteration,
                })
                .collect();
            running
                .completed
                .insert(StepInstanceKey::in_loops(loop_step.id.clone(), outer_path));
        };

        match loop_step.kind {
            LoopKind::For | LoopKind::ForEach => {
                let resolved = self.resolved_total(loop_step)?;
                let bound = resolved.min(loop_step.max_iterations);
                if next_iteration < bound {
                    self.advance_iteration(running);
                } else if resolved > loop_step.max_iterations {
                    exit(
                        self,
                        running,
                        TraceEntry::new(
                            TraceKind::LoopMaxIterationsReached,
                            format!(
                                "loop '{}' stopped at the maxIterations ceiling of {}",
                                loop_step.id, loop_step.max_iterations
                            ),
                        ),
                    );
                } else {
                    exit(
                        self,
                        running,
                        TraceEntry::new(
                            TraceKind::ExitedLoop,
                            format!("loop '{}' finished all {bound} iterations", loop_step.id),
                        ),
                    );
                }
            }
            LoopKind::While | LoopKind::Until => {
                if next_iteration >= loop_step.max_iterations {
                    exit(
                        self,
                        running,
                        TraceEntry::new(
                            TraceKind::LoopMaxIterationsReached,
                            format!(
                                "loop '{}' stopped at the maxIterations ceiling of {}",
                                loop_step.id, loop_step.max_iterations
                            ),
                        ),
                    );
                    return Ok(());
                }
                if self.continuation_holds(loop_step)? {
                    self.advance_iteration(running);
                } else {
                    exit(
                        self,
                        running,
                        TraceEntry::new(
                            TraceKind::ExitedLoop,
                            format!("loop '{}' condition ended the loop", loop_step.id),
                        ),
                    );
                }
            }
        }
        Ok(())
    }

    fn advance_iteration(&mut self, running: &mut RunningState) {
        if let Some(frame) = running.loop_stack.last_mut() {
            frame.iteration += 1;
            frame.body_index = 0;
            self.trace.push(TraceEntry::new(
                TraceKind::EvaluatedCondition,
                format!(
                    "loop '{}' continues into iteration {}",
                    frame.loop_id, frame.iteration
                ),
            ));
        }
    }

    /// Whether a while/until loop runs another iteration.
    fn continuation_holds(&mut self, loop_step: &CompiledLoop) -> Result<bool, InterpreterError> {
        match &loop_step.condition_source {
            Some(ConditionSource::ArtifactContract { contract, loop_id }) => {
                // Context is ignored entirely on this branch.
                let artifact = self
                    .artifacts
                    .iter()
                    .rev()
                    .find(|artifact| {
                        artifact.kind == *contract && artifact.loop_id.as_deref() == Some(loop_id)
                    })
                    .ok_or_else(|| InterpreterError::MissingLoopArtifact {
                        loop_id: loop_id.clone(),
                        contract: contract.clone(),
                    })?;
                let decision = artifact.decision.ok_or_else(|| {
                    InterpreterError::MissingLoopArtifact {
                        loop_id: loop_id.clone(),
                        contract: contract.clone(),
                    }
                })?;
                let continues = decision == LoopDecision::Continue;
                self.trace.push(TraceEntry::new(
                    TraceKind::EvaluatedCondition,
                    format!(
                        "artifact: loop '{}' decision is {}",
                        loop_step.id,
                        if continues { "continue" } else { "stop" }
                    ),
                ));
                Ok(continues)
            }
            Some(ConditionSource::ContextVariable { condition }) => {
                // Artifacts are ignored entirely on this branch.
                let (holds, _) = evaluate_with_guidance(condition, self.context);
                let continues = match loop_step.kind {
                    LoopKind::While => holds,
                    LoopKind::Until => !holds,
                    LoopKind::For | LoopKind::ForEach => false,
                };
                self.trace.push(TraceEntry::new(
                    TraceKind::EvaluatedCondition,
                    format!(
                        "context: loop '{}' condition evaluated {holds}",
                        loop_step.id
                    ),
                ));
                Ok(continues)
            }
            None => Err(InterpreterError::MissingConditionSource {
                loop_id: loop_step.id.clone(),
            }),
        }
    }

    fn select_top_level(
        &mut self,
        running: &mut RunningState,
    ) -> Result<TopLevelOutcome, InterpreterError> {
        let compiled = self.compiled;
        for step_id in compiled.top_level() {
            if compiled.is_loop_body_step(step_id) {
                continue;
            }
            let key = StepInstanceKey::top_level(step_id.clone());
            if running.completed.contains(&key) {
                continue;
            }
            let step = compiled
                .step(step_id)
                .ok_or_else(|| InterpreterError::UnknownStep {
                    step_id: step_id.clone(),
                })?;
            if !self.run_condition_holds(step) {
                continue;
            }

            match step {
                CompiledStep::Leaf(_) => {
                    self.trace.push(TraceEntry::new(
                        TraceKind::SelectedNextStep,
                        format!("selected top-level step '{step_id}'"),
                    ));
                    return Ok(TopLevelOutcome::Selected(key));
                }
                CompiledStep::Loop(loop_step) => {
                    if self.enter_loop(loop_step)? {
                        running.loop_stack.push(LoopFrame {
                            loop_id: loop_step.id.clone(),
                            iteration: 0,
                            body_index: 0,
                        });
                        self.trace.push(TraceEntry::new(
                            TraceKind::EnteredLoop,
                            format!("entered loop '{}'", loop_step.id),
                        ));
                        return Ok(TopLevelOutcome::EnteredLoop);
                    }
                    // Skipped without entering: the loop instance is done.
                    running.completed.insert(key);
                }
            }
        }
        Ok(TopLevelOutcome::Exhausted)
    }

    /// Whether a loop's first iteration runs.
    fn enter_loop(&mut self, loop_step: &CompiledLoop) -> Result<bool, InterpreterError> {
        match loop_step.kind {
            LoopKind::For | LoopKind::ForEach => {
                let resolved = self.resolved_total(loop_step)?;
                let enters = resolved.min(loop_step.max_iterations) > 0;
                self.trace.push(TraceEntry::new(
                    TraceKind::EvaluatedCondition,
                    format!(
                        "context: loop '{}' has {resolved} iteration(s) available",
                        loop_step.id
                    ),
                ));
                Ok(enters)
            }
            LoopKind::While | LoopKind::Until => match &loop_step.condition_source {
                // The controlling artifact is produced by the body, so the
                // first iteration always runs.
                Some(ConditionSource::ArtifactContract { .. }) => {
                    self.trace.push(TraceEntry::new(
                        TraceKind::EvaluatedCondition,
                        format!(
                            "artifact: loop '{}' enters its first iteration",
                            loop_step.id
                        ),
                    ));
                    Ok(true)
                }
                Some(ConditionSource::ContextVariable { condition }) => {
                    let (holds, guidance) = evaluate_with_guidance(condition, self.context);
                    let enters = match loop_step.kind {
                        LoopKind::While => holds,
                        _ => !holds,
                    };
                    if !enters {
                        self.guidance.extend(guidance);
                    }
                    self.trace.push(TraceEntry::new(
                        TraceKind::EvaluatedCondition,
                        format!(
                            "context: loop '{}' entry condition evaluated {holds}",
                            loop_step.id
                        ),
                    ));
                    Ok(enters)
                }
                None => Err(InterpreterError::MissingConditionSource {
                    loop_id: loop_step.id.clone(),
                }),
            },
        }
    }

    /// Resolved natural iteration total for for/forEach loops.
    fn resolved_total(&self, loop_step: &CompiledLoop) -> Result<u32, InterpreterError> {
        match loop_step.kind {
            LoopKind::For => match &loop_step.count {
                Some(CountSource::Literal(count)) => Ok(*count),
                Some(CountSource::ContextVar(name)) => {
                    let value = self.context.get(name).ok_or_else(|| {
                        InterpreterError::MissingContextVariable { name: name.clone() }
                    })?;
                    wr_workflow::coerce_number(value)
                        .filter(|n| *n >= 0.0)
                        .map(|n| n as u32)
                        .ok_or_else(|| InterpreterError::MissingContextVariable {
                            name: name.clone(),
                        })
                }
                None => Err(InterpreterError::MissingContextVariable {
                    name: format!("count for loop '{}'", loop_step.id),
                }),
            },
            LoopKind::ForEach => {
                let name = loop_step.items.as_deref().unwrap_or_default();
                let value = self.context.get(name).ok_or_else(|| {
                    InterpreterError::MissingContextVariable {
                        name: name.to_string(),
                    }
                })?;
                let items = value
                    .as_array()
                    .ok_or_else(|| InterpreterError::ItemsNotAnArray {
                        name: name.to_string(),
                    })?;
                Ok(items.len().min(u32::MAX as usize) as u32)
            }
            LoopKind::While | LoopKind::Until => Ok(loop_step.max_iterations),
        }
    }

    fn run_condition_holds(&mut self, step: &CompiledStep) -> bool {
        let Some(condition) = step.run_condition() else {
            return true;
        };
        let (holds, guidance) = evaluate_with_guidance(condition, self.context);
        self.trace.push(TraceEntry::with_detail(
            TraceKind::EvaluatedCondition,
            format!(
                "context: runCondition for '{}' evaluated {holds}",
                step.id()
            ),
            serde_json::json!({ "stepId": step.id(), "holds": holds }),
        ));
        if !holds {
            self.guidance.extend(guidance);
        }
        holds
    }

    fn loop_config(&self, loop_id: &str) -> Result<&'a CompiledLoop, InterpreterError> {
        self.compiled
            .loop_config(loop_id)
            .ok_or_else(|| InterpreterError::UnknownStep {
                step_id: loop_id.to_string(),
            })
    }
}

enum TopLevelOutcome {
    Selected(StepInstanceKey),
    EnteredLoop,
    Exhausted,
}

#[cfg(test)]
#[path = "interpreter_tests.rs"]
mod interpreter_tests;
