//! The execution orchestrator: token-based API over the interpreter and the
//! durable session log.

mod advance;
pub mod config;
pub mod context_budget;
pub mod error;
pub mod exec_snapshot;
pub mod orchestrator;
pub mod ports;
pub mod projection;
pub mod response;
mod resume;

pub use config::{DATA_DIR_ENV, resolve_data_dir};
pub use context_budget::{MAX_CONTEXT_BYTES, MAX_CONTEXT_DEPTH, validate_context};
pub use error::{ToolError, ToolErrorCode};
pub use exec_snapshot::ExecutionSnapshot;
pub use orchestrator::{ContinueRequest, NODE_OUTPUT_LIMIT_BYTES, Orchestrator};
pub use ports::{
    GitWorkspaceProbe, InMemoryWorkflowSource, StaticWorkspaceProbe, WorkflowSource,
    WorkspaceProbe, WorkspaceSnapshot,
};
pub use projection::{
    capabilities_by_node, effective_context, effective_preferences, last_note, latest_node,
    observations,
};
pub use response::{
    BlockerView, CheckpointResponse, ContinueKind, ContinueResponse, InspectMode, NextCall,
    NextIntent, PendingStep, ResumeCandidate, StartResponse, StepPreview, WorkflowInspection,
    WorkflowSummary,
};
pub use resume::MAX_RESUME_CANDIDATES;
