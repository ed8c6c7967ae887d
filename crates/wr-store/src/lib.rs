//! Durable session event log and content-addressed snapshot store.

pub mod event;
pub mod log;
pub mod manifest;
pub mod segment;
pub mod snapshot;

pub use event::{
    AdvanceOutcome, Autonomy, Blocker, BlockerKind, EdgeCause, EventBody, EventEnvelope, EventId,
    EventScope, GapSeverity, NodeKind, Preferences, RiskPolicy, advance_dedupe_key,
    checkpoint_dedupe_key,
};
pub use log::{
    AppendOutcome, AppendPlan, CorruptionLocation, CorruptionReason, HealthySessionLock,
    SessionLogState, SessionStoreError, list_session_ids, load_session_state,
    open_session_healthy, session_dir,
};
pub use manifest::{ManifestRecord, ManifestRecordBody, SnapshotPin};
pub use snapshot::{SnapshotStore, SnapshotStoreError};
