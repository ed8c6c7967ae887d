//! The tool-visible error taxonomy and exhaustive mappings from every
//! internal layer.
//!
//! Internal layers keep their own closed unions; this module is the only
//! place they become wire codes. Every `match` here is exhaustive on the
//! foreign union, so adding a variant upstream is a compile-time break
//! rather than a silent `INTERNAL_ERROR`.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use wr_engine::{InterpreterError, TransitionError};
use wr_store::{CorruptionLocation, SessionStoreError, SnapshotStoreError};
use wr_token::TokenError;
use wr_validate::ValidationError;
use wr_workflow::CompileError;

/// Retry hint attached to IO-flavored failures.
pub const IO_RETRY_HINT_MS: u64 = 1000;

/// The closed set of codes visible to tool callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorCode {
    ValidationError,
    PreconditionFailed,
    NotFound,
    TokenInvalidFormat,
    TokenUnsupportedVersion,
    TokenBadSignature,
    TokenScopeMismatch,
    TokenUnknownNode,
    TokenWorkflowHashMismatch,
    TokenSessionLocked,
    SessionNotHealthy,
    MissingContext,
    InternalError,
}

/// A tool-visible failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{code:?}: {message}")]
pub struct ToolError {
    pub code: ToolErrorCode,
    pub message: String,
    pub retryable: bool,

    /// Suggested wait before retrying, for retryable outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ToolError {
    pub fn new(code: ToolErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: sanitize_paths(&message.into()),
            retryable: false,
            after_ms: None,
            suggestion: None,
            details: None,
        }
    }

    pub fn retryable_after(mut self, after_ms: u64) -> Self {
        self.retryable = true;
        self.after_ms = Some(after_ms);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::InternalError, message)
            .with_suggestion("this indicates a bug; the session log was not modified")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::ValidationError, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::PreconditionFailed, message)
    }
}

/// Strip the home directory from diagnostics before they leave the engine.
pub fn sanitize_paths(message: &str) -> String {
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => message.replace(&home, "~"),
        _ => message.to_string(),
    }
}

impl From<TokenError> for ToolError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InvalidFormat(detail) => Self::new(
                ToolErrorCode::TokenInvalidFormat,
                format!("token format invalid: {detail}"),
            )
            .with_suggestion("pass tokens back exactly as issued"),
            TokenError::UnsupportedVersion(version) => Self::new(
                ToolErrorCode::TokenUnsupportedVersion,
                format!("token version '{version}' is not supported"),
            ),
            TokenError::BadSignature => Self::new(
                ToolErrorCode::TokenBadSignature,
                "token signature verification failed",
            ),
            TokenError::ScopeMismatch { field } => Self::new(
                ToolErrorCode::TokenScopeMismatch,
                format!("state and ack tokens disagree on {field}"),
            ),
        }
    }
}

impl From<SessionStoreError> for ToolError {
    fn from(err: SessionStoreError) -> Self {
        match err {
            SessionStoreError::LockBusy {
                holder,
                retry_after_ms,
            } => Self::new(
                ToolErrorCode::TokenSessionLocked,
                format!("session is locked: {holder}"),
            )
            .retryable_after(retry_after_ms)
            .with_suggestion("another call is writing this session; retry shortly"),
            SessionStoreError::LockReentrant(path) => {
                Self::internal(format!("reentrant session lock at {}", path.display()))
            }
            SessionStoreError::CorruptionDetected { location, reason } => Self::new(
                ToolErrorCode::SessionNotHealthy,
                format!("session log corruption: {reason}"),
            )
            .with_details(json!({
                "location": match location {
                    CorruptionLocation::Head => "head",
                    CorruptionLocation::Tail => "tail",
                },
                "reason": reason.to_string(),
            })),
            SessionStoreError::Io { context, source } => Self::new(
                ToolErrorCode::SessionNotHealthy,
                format!("session store io failure ({context}): {source}"),
            )
            .retryable_after(IO_RETRY_HINT_MS),
            SessionStoreError::InvariantViolation(detail) => {
                Self::internal(format!("session store invariant violation: {detail}"))
            }
        }
    }
}

impl From<SnapshotStoreError> for ToolError {
    fn from(err: SnapshotStoreError) -> Self {
        match err {
            SnapshotStoreError::Io { context, source } => Self::new(
                ToolErrorCode::SessionNotHealthy,
                format!("snapshot store io failure ({context}): {source}"),
            )
            .retryable_after(IO_RETRY_HINT_MS),
            SnapshotStoreError::Encode(detail) => {
                Self::internal(format!("snapshot body not canonicalizable: {detail}"))
            }
            SnapshotStoreError::CorruptBlob { digest } => Self::new(
                ToolErrorCode::SessionNotHealthy,
                format!("snapshot blob {digest} fails verification"),
            ),
        }
    }
}

impl From<CompileError> for ToolError {
    fn from(err: CompileError) -> Self {
        match &err {
            CompileError::EmptyWorkflow => {
                Self::precondition("workflow has no steps").with_suggestion(
                    "author at least one step before starting the workflow",
                )
            }
            CompileError::DuplicateStepId { .. }
            | CompileError::MixedPromptForms { .. }
            | CompileError::MissingPrompt { .. }
            | CompileError::UnknownSnippetRef { .. }
            | CompileError::UnknownFunction { .. }
            | CompileError::UnknownOutputContract { .. }
            | CompileError::UnknownBodyStep { .. }
            | CompileError::NestedLoop { .. }
            | CompileError::EmptyLoopBody { .. }
            | CompileError::InvalidLoopConfig { .. }
            | CompileError::MaxIterationsTooHigh { .. } => Self::validation(err.to_string())
                .with_suggestion("fix the workflow definition and start again"),
            CompileError::Hashing(_) | CompileError::MalformedPinnedSnapshot(_) => {
                Self::internal(err.to_string())
            }
        }
    }
}

impl From<InterpreterError> for ToolError {
    fn from(err: InterpreterError) -> Self {
        match &err {
            InterpreterError::MissingContextVariable { name } => Self::new(
                ToolErrorCode::MissingContext,
                format!("context variable '{name}' is required but missing"),
            )
            .with_suggestion(format!("supply '{name}' in the context and continue again"))
            .with_details(json!({"missing": name, "kind": "variable"})),
            InterpreterError::ItemsNotAnArray { name } => Self::new(
                ToolErrorCode::MissingContext,
                format!("context variable '{name}' must be an array"),
            )
            .with_details(json!({"missing": name, "kind": "variable"})),
            InterpreterError::MissingLoopArtifact { loop_id, contract } => Self::new(
                ToolErrorCode::MissingContext,
                format!("loop '{loop_id}' requires a '{contract}' artifact before advancing"),
            )
            .with_suggestion("emit the loop-control artifact from the loop body step")
            .with_details(json!({"missing": contract, "loopId": loop_id, "kind": "artifact"})),
            InterpreterError::MissingConditionSource { .. } => {
                Self::precondition(err.to_string())
            }
            InterpreterError::UnknownStep { .. }
            | InterpreterError::InvalidStateKind { .. } => Self::internal(err.to_string()),
        }
    }
}

impl From<TransitionError> for ToolError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::InvalidTransition { .. } => Self::internal(err.to_string()),
        }
    }
}

impl From<ValidationError> for ToolError {
    fn from(err: ValidationError) -> Self {
        match &err {
            ValidationError::SchemaCompilationFailed { .. }
            | ValidationError::InvalidCriteriaFormat { .. }
            | ValidationError::EvaluationThrew { .. } => {
                Self::validation(err.to_string()).with_suggestion(
                    "the workflow's validation criteria are malformed; fix the definition",
                )
            }
        }
    }
}

impl From<ConfigError> for ToolError {
    fn from(err: ConfigError) -> Self {
        match &err {
            ConfigError::NoDataDir => Self::precondition(err.to_string()),
            ConfigError::Io { .. } => {
                Self::new(ToolErrorCode::SessionNotHealthy, err.to_string())
                    .retryable_after(IO_RETRY_HINT_MS)
            }
        }
    }
}
