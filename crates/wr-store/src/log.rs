//! The durable session event log.
//!
//! Layout per session:
//!
//! ```text
//! <dataDir>/sessions/<sessionId>/
//!     lock             fail-fast exclusive lock file
//!     events/          segment files named <firstIdx>-<lastIdx>.jsonl
//!     manifest.jsonl   append-only: segment_closed | snapshot_pinned
//! ```
//!
//! Writes follow the pin-after-close protocol: events become durable in a
//! segment, the manifest attests the segment, and only then are snapshot
//! pins appended. Loads replay the manifest top to bottom and classify any
//! inconsistency instead of guessing.

use crate::event::{EventBody, EventEnvelope, EVENT_SCHEMA_VERSION};
use crate::manifest::{ManifestRecord, ManifestRecordBody, SnapshotPin};
use crate::segment::{
    encode_segment, fsync_dir, segment_file_name, segment_sha256, write_segment_atomic,
};
use std::collections::{BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use wr_core::{ContentDigest, NodeId, RunId, SessionId};
use wr_lock::{LOCK_RETRY_HINT_MS, LockError, SessionLock, acquire_session_lock};

const MANIFEST_FILE_NAME: &str = "manifest.jsonl";
const EVENTS_DIR_NAME: &str = "events";

/// Where in the log a corruption was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionLocation {
    Head,
    Tail,
}

/// Why a load refused the log.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CorruptionReason {
    #[error("missing_attested_segment: '{segment}' has a manifest record but no file")]
    MissingAttestedSegment { segment: String },

    #[error("segment_hash_mismatch: '{segment}' does not match its attested sha256")]
    SegmentHashMismatch { segment: String },

    #[error("schema_validation_failed: '{segment}' line {line} is not a valid event record")]
    SchemaValidationFailed { segment: String, line: usize },

    #[error("unknown_schema_version: '{segment}' line {line} has event version {version}")]
    UnknownSchemaVersion {
        segment: String,
        line: usize,
        version: u64,
    },

    #[error("non_contiguous_event_index: expected {expected}, found {found}")]
    NonContiguousEventIndex { expected: u64, found: u64 },

    #[error("duplicate_dedupe_key: '{key}' appears more than once")]
    DuplicateDedupeKey { key: String },

    #[error("missing_snapshot_pin: '{snapshot_ref}' was introduced but never pinned")]
    MissingSnapshotPin { snapshot_ref: ContentDigest },

    #[error("pin_before_segment_close: '{snapshot_ref}' pinned ahead of its segment")]
    PinBeforeSegmentClose { snapshot_ref: ContentDigest },

    #[error("manifest_record_malformed: manifest line {line} is unreadable")]
    ManifestRecordMalformed { line: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum SessionStoreError {
    #[error("session lock busy ({holder}); retry in {retry_after_ms} ms")]
    LockBusy { holder: String, retry_after_ms: u64 },

    #[error("session lock at '{0}' re-acquired by the same process")]
    LockReentrant(PathBuf),

    #[error("session log corruption ({location:?}): {reason}")]
    CorruptionDetected {
        location: CorruptionLocation,
        reason: CorruptionReason,
    },

    #[error("session store io failure ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session store invariant violation: {0}")]
    InvariantViolation(String),
}

impl From<LockError> for SessionStoreError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy { holder } => Self::LockBusy {
                holder,
                retry_after_ms: LOCK_RETRY_HINT_MS,
            },
            LockError::Reentrant(path) => Self::LockReentrant(path),
            LockError::Io { path, source } => Self::Io {
                context: format!("lock file at {}", path.display()),
                source,
            },
        }
    }
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> SessionStoreError {
    let context = context.into();
    move |source| SessionStoreError::Io { context, source }
}

/// Directory of one session under a data root.
pub fn session_dir(data_dir: &Path, session: &SessionId) -> PathBuf {
    data_dir.join("sessions").join(session.as_str())
}

/// Enumerate session ids under a data root, skipping foreign entries.
pub fn list_session_ids(data_dir: &Path) -> Result<Vec<SessionId>, SessionStoreError> {
    let sessions_dir = data_dir.join("sessions");
    if !sessions_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(&sessions_dir)
        .map_err(io_err(format!("listing {}", sessions_dir.display())))?;

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err("reading sessions directory entry"))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        match SessionId::parse(&name) {
            Ok(id) => ids.push(id),
            Err(_) => {
                tracing::debug!(entry = %name, "skipping non-session entry");
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// The loaded, verified truth of one session.
#[derive(Debug, Clone)]
pub struct SessionLogState {
    session_id: SessionId,
    events: Vec<EventEnvelope>,
    dedupe_index: HashMap<String, u64>,
    node_index: HashMap<NodeId, u64>,
    children: HashMap<NodeId, Vec<NodeId>>,
    pinned: BTreeSet<ContentDigest>,
    segments: Vec<String>,
}

impl SessionLogState {
    fn empty(session_id: SessionId) -> Self {
        Self {
            session_id,
            events: Vec::new(),
            dedupe_index: HashMap::new(),
            node_index: HashMap::new(),
            children: HashMap::new(),
            pinned: BTreeSet::new(),
            segments: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    pub fn next_event_index(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn contains_dedupe_key(&self, key: &str) -> bool {
        self.dedupe_index.contains_key(key)
    }

    pub fn event_by_dedupe_key(&self, key: &str) -> Option<&EventEnvelope> {
        self.dedupe_index
            .get(key)
            .map(|&index| &self.events[index as usize])
    }

    /// The `node_created` event for a node id.
    pub fn node_created(&self, node: &NodeId) -> Option<&EventEnvelope> {
        self.node_index
            .get(node)
            .map(|&index| &self.events[index as usize])
    }

    /// Child node ids created by edges out of `node`, in record order.
    pub fn children_of(&self, node: &NodeId) -> &[NodeId] {
        self.children.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Snapshot refs attested by `snapshot_pinned` records.
    pub fn pinned_snapshots(&self) -> &BTreeSet<ContentDigest> {
        &self.pinned
    }

    /// Most recent `node_output_appended` markdown scoped to `node`.
    pub fn last_output_for(&self, node: &NodeId) -> Option<&str> {
        self.events.iter().rev().find_map(|event| match &event.body {
            EventBody::NodeOutputAppended { markdown }
                if event.scope.as_ref().and_then(|s| s.node_id.as_ref()) == Some(node) =>
            {
                Some(markdown.as_str())
            }
            _ => None,
        })
    }

    /// The most recent `run_started` event, if any.
    pub fn latest_run(&self) -> Option<(&RunId, &EventEnvelope)> {
        self.events.iter().rev().find_map(|event| match &event.body {
            EventBody::RunStarted { .. } => {
                let run_id = event.scope.as_ref()?.run_id.as_ref()?;
                Some((run_id, event))
            }
            _ => None,
        })
    }

    fn index_event(&mut self, event: EventEnvelope) {
        let index = event.event_index;
        self.dedupe_index.insert(event.dedupe_key.clone(), index);
        match &event.body {
            EventBody::NodeCreated { node_id, .. } => {
                self.node_index.insert(node_id.clone(), index);
            }
            EventBody::EdgeCreated {
                from_node_id,
                to_node_id,
                ..
            } => {
                self.children
                    .entry(from_node_id.clone())
                    .or_default()
                    .push(to_node_id.clone());
            }
            _ => {}
        }
        self.events.push(event);
    }
}

/// Plan of events plus the snapshot pins attesting their snapshot refs.
#[derive(Debug, Clone)]
pub struct AppendPlan {
    pub events: Vec<EventEnvelope>,
    pub snapshot_pins: Vec<SnapshotPin>,
}

/// Result of applying an append plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New events were durably committed.
    Committed,
    /// Every planned event was already recorded; nothing was written.
    Replayed,
}

/// Witness that the session lock is held and the log loaded healthy.
///
/// All mutating operations require this value; it can only be produced by
/// [`open_session_healthy`], and the borrow checker makes use-after-release
/// unrepresentable (dropping the witness releases the lock).
pub struct HealthySessionLock {
    _lock: SessionLock,
    session_path: PathBuf,
    state: SessionLogState,
}

impl std::fmt::Debug for HealthySessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthySessionLock")
            .field("session_path", &self.session_path)
            .field("next_event_index", &self.state.next_event_index())
            .finish()
    }
}

/// Acquire the session lock and load the log, verifying health.
pub fn open_session_healthy(
    session_path: &Path,
    session_id: &SessionId,
    reason: &str,
) -> Result<HealthySessionLock, SessionStoreError> {
    let lock = acquire_session_lock(session_path, reason)?;
    let state = load_session_state(session_path, session_id)?;
    Ok(HealthySessionLock {
        _lock: lock,
        session_path: session_path.to_path_buf(),
        state,
    })
}

impl HealthySessionLock {
    pub fn state(&self) -> &SessionLogState {
        &self.state
    }

    /// Apply an append plan atomically under the held lock.
    ///
    /// A plan whose events are all already recorded (by dedupe key) is a
    /// replay no-op. A plan that mixes recorded and new events is a
    /// conflict. Otherwise the plan commits: segment, `segment_closed`,
    /// then `snapshot_pinned` records, each durably flushed in that order.
    pub fn append(&mut self, plan: AppendPlan) -> Result<AppendOutcome, SessionStoreError> {
        self.validate_plan(&plan)?;

        let already = plan
            .events
            .iter()
            .filter(|event| self.state.contains_dedupe_key(&event.dedupe_key))
            .count();
        if already == plan.events.len() {
            tracing::debug!(
                session_id = %self.state.session_id,
                events = plan.events.len(),
                "append plan is a replay no-op"
            );
            return Ok(AppendOutcome::Replayed);
        }
        if already > 0 {
            return Err(SessionStoreError::InvariantViolation(format!(
                "append plan mixes {already} recorded events with new ones"
            )));
        }

        let first = plan.events[0].event_index;
        let last = plan.events[plan.events.len() - 1].event_index;
        let file_name = segment_file_name(first, last);
        let events_dir = self.session_path.join(EVENTS_DIR_NAME);

        let bytes = encode_segment(&plan.events).map_err(|err| {
            SessionStoreError::InvariantViolation(format!("unserializable event: {err}"))
        })?;
        write_segment_atomic(&events_dir, &file_name, &bytes)
            .map_err(io_err(format!("writing segment {file_name}")))?;

        // segment_closed must be durable before any snapshot_pinned record.
        self.append_manifest_records(&[ManifestRecord::segment_closed(
            file_name.clone(),
            bytes.len() as u64,
            segment_sha256(&bytes),
        )])?;
        if !plan.snapshot_pins.is_empty() {
            let pins: Vec<ManifestRecord> = plan
                .snapshot_pins
                .iter()
                .cloned()
                .map(ManifestRecord::snapshot_pinned)
                .collect();
            self.append_manifest_records(&pins)?;
        }

        tracing::info!(
            session_id = %self.state.session_id,
            segment = %file_name,
            events = plan.events.len(),
            pins = plan.snapshot_pins.len(),
            "append plan committed"
        );

        self.state.segments.push(file_name);
        for pin in &plan.snapshot_pins {
            self.state.pinned.insert(pin.snapshot_ref);
        }
        for event in plan.events {
            self.state.index_event(event);
        }
        Ok(AppendOutcome::Committed)
    }

    fn validate_plan(&self, plan: &AppendPlan) -> Result<(), SessionStoreError> {
        if plan.events.is_empty() {
            return Err(SessionStoreError::InvariantViolation(
                "append plan has no events".to_string(),
            ));
        }

        let mut seen_keys = std::collections::HashSet::new();
        for event in &plan.events {
            if event.session_id != self.state.session_id {
                return Err(SessionStoreError::InvariantViolation(format!(
                    "event {} targets session {}, log belongs to {}",
                    event.event_id, event.session_id, self.state.session_id
                )));
            }
            if !seen_keys.insert(event.dedupe_key.as_str()) {
                return Err(SessionStoreError::InvariantViolation(format!(
                    "dedupe key '{}' repeated within one plan",
                    event.dedupe_key
                )));
            }
        }

        // Contiguity only matters for plans that will actually write; replay
        // plans carry the indexes they were recorded at.
        let any_new = plan
            .events
            .iter()
            .any(|event| !self.state.contains_dedupe_key(&event.dedupe_key));
        if any_new {
            let mut expected = self.state.next_event_index();
            for event in &plan.events {
                if event.event_index != expected {
                    return Err(SessionStoreError::InvariantViolation(format!(
                        "event index {} is not contiguous (expected {expected})",
                        event.event_index
                    )));
                }
                expected += 1;
            }

            let pinned_in_plan: BTreeSet<&ContentDigest> = plan
                .snapshot_pins
                .iter()
                .map(|pin| &pin.snapshot_ref)
                .collect();
            for event in &plan.events {
                if let Some(snapshot_ref) = event.body.introduced_snapshot_ref() {
                    let covered = pinned_in_plan.contains(snapshot_ref)
                        || self.state.pinned.contains(snapshot_ref);
                    if !covered {
                        return Err(SessionStoreError::InvariantViolation(format!(
                            "event {} introduces {snapshot_ref} without a pin",
                            event.event_id
                        )));
                    }
                }
            }
            for pin in &plan.snapshot_pins {
                let in_range = pin.event_index >= plan.events[0].event_index
                    && pin.event_index <= plan.events[plan.events.len() - 1].event_index;
                if !in_range {
                    return Err(SessionStoreError::InvariantViolation(format!(
                        "pin for {} references event index {} outside the plan",
                        pin.snapshot_ref, pin.event_index
                    )));
                }
            }
        }
        Ok(())
    }

    fn append_manifest_records(
        &self,
        records: &[ManifestRecord],
    ) -> Result<(), SessionStoreError> {
        let manifest_path = self.session_path.join(MANIFEST_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&manifest_path)
            .map_err(io_err(format!("opening {}", manifest_path.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&manifest_path, std::fs::Permissions::from_mode(0o600))
                .map_err(io_err("setting manifest permissions"))?;
        }

        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record).map_err(|err| {
                SessionStoreError::InvariantViolation(format!(
                    "unserializable manifest record: {err}"
                ))
            })?;
            buf.push(b'\n');
        }
        file.write_all(&buf).map_err(io_err("appending manifest"))?;
        file.sync_all().map_err(io_err("flushing manifest"))?;
        fsync_dir(&self.session_path).map_err(io_err("flushing session directory"))?;
        Ok(())
    }
}

/// Read-only, fact-returning load of a session log. Takes no lock.
pub fn load_session_state(
    session_path: &Path,
    session_id: &SessionId,
) -> Result<SessionLogState, SessionStoreError> {
    let manifest_path = session_path.join(MANIFEST_FILE_NAME);
    let mut state = SessionLogState::empty(session_id.clone());

    let manifest_bytes = match std::fs::read(&manifest_path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(state),
        Err(err) => return Err(io_err(format!("reading {}", manifest_path.display()))(err)),
    };

    let complete_lines: Vec<&[u8]> = split_complete_lines(&manifest_bytes);
    let torn_tail = !manifest_bytes.is_empty() && !manifest_bytes.ends_with(b"\n");
    let line_count = complete_lines.len() + usize::from(torn_tail);

    // Refs introduced by loaded events that still await their pin record.
    let mut awaiting_pin: BTreeSet<ContentDigest> = BTreeSet::new();
    let mut run_hashes: HashMap<RunId, ContentDigest> = HashMap::new();

    for (line_number, line) in complete_lines.iter().enumerate() {
        let location = if line_number + 1 == line_count {
            CorruptionLocation::Tail
        } else {
            CorruptionLocation::Head
        };
        let record: ManifestRecord = serde_json::from_slice(line).map_err(|_| {
            SessionStoreError::CorruptionDetected {
                location,
                reason: CorruptionReason::ManifestRecordMalformed { line: line_number },
            }
        })?;

        match record.body {
            ManifestRecordBody::SegmentClosed {
                segment,
                bytes,
                sha256,
            } => {
                load_segment(
                    session_path,
                    &segment,
                    bytes,
                    &sha256,
                    location,
                    &mut state,
                    &mut awaiting_pin,
                    &mut run_hashes,
                )?;
                state.segments.push(segment);
            }
            ManifestRecordBody::SnapshotPinned(pin) => {
                if pin.event_index >= state.next_event_index() {
                    return Err(SessionStoreError::CorruptionDetected {
                        location,
                        reason: CorruptionReason::PinBeforeSegmentClose {
                            snapshot_ref: pin.snapshot_ref,
                        },
                    });
                }
                awaiting_pin.remove(&pin.snapshot_ref);
                state.pinned.insert(pin.snapshot_ref);
            }
        }
    }

    if torn_tail {
        return Err(SessionStoreError::CorruptionDetected {
            location: CorruptionLocation::Tail,
            reason: CorruptionReason::ManifestRecordMalformed {
                line: line_count - 1,
            },
        });
    }

    if let Some(snapshot_ref) = awaiting_pin.into_iter().next() {
        return Err(SessionStoreError::CorruptionDetected {
            location: CorruptionLocation::Tail,
            reason: CorruptionReason::MissingSnapshotPin { snapshot_ref },
        });
    }

    Ok(state)
}

#[allow(clippy::too_many_arguments)]
fn load_segment(
    session_path: &Path,
    segment: &str,
    attested_bytes: u64,
    attested_sha256: &str,
    location: CorruptionLocation,
    state: &mut SessionLogState,
    awaiting_pin: &mut BTreeSet<ContentDigest>,
    run_hashes: &mut HashMap<RunId, ContentDigest>,
) -> Result<(), SessionStoreError> {
    let corrupt = |reason| SessionStoreError::CorruptionDetected { location, reason };

    let path = session_path.join(EVENTS_DIR_NAME).join(segment);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(corrupt(CorruptionReason::MissingAttestedSegment {
                segment: segment.to_string(),
            }));
        }
        Err(err) => return Err(io_err(format!("reading segment {segment}"))(err)),
    };

    if bytes.len() as u64 != attested_bytes || segment_sha256(&bytes) != attested_sha256 {
        return Err(corrupt(CorruptionReason::SegmentHashMismatch {
            segment: segment.to_string(),
        }));
    }

    for (line_number, line) in split_complete_lines(&bytes).iter().enumerate() {
        let raw: serde_json::Value = serde_json::from_slice(line).map_err(|_| {
            corrupt(CorruptionReason::SchemaValidationFailed {
                segment: segment.to_string(),
                line: line_number,
            })
        })?;
        let version = raw.get("v").and_then(serde_json::Value::as_u64).ok_or_else(|| {
            corrupt(CorruptionReason::SchemaValidationFailed {
                segment: segment.to_string(),
                line: line_number,
            })
        })?;
        if version != u64::from(EVENT_SCHEMA_VERSION) {
            return Err(corrupt(CorruptionReason::UnknownSchemaVersion {
                segment: segment.to_string(),
                line: line_number,
                version,
            }));
        }
        let event: EventEnvelope = serde_json::from_value(raw).map_err(|_| {
            corrupt(CorruptionReason::SchemaValidationFailed {
                segment: segment.to_string(),
                line: line_number,
            })
        })?;

        let expected = state.next_event_index();
        if event.event_index != expected {
            return Err(corrupt(CorruptionReason::NonContiguousEventIndex {
                expected,
                found: event.event_index,
            }));
        }
        if state.contains_dedupe_key(&event.dedupe_key) {
            return Err(corrupt(CorruptionReason::DuplicateDedupeKey {
                key: event.dedupe_key.clone(),
            }));
        }

        if let Some(snapshot_ref) = event.body.introduced_snapshot_ref() {
            if !state.pinned.contains(snapshot_ref) {
                awaiting_pin.insert(*snapshot_ref);
            }
        }

        // run_started.workflowHash must equal every node_created.workflowHash
        // within that run.
        match &event.body {
            EventBody::RunStarted { workflow_hash, .. } => {
                if let Some(run_id) = event.scope.as_ref().and_then(|s| s.run_id.clone()) {
                    run_hashes.insert(run_id, *workflow_hash);
                }
            }
            EventBody::NodeCreated { workflow_hash, .. } => {
                if let Some(run_id) = event.scope.as_ref().and_then(|s| s.run_id.as_ref()) {
                    if let Some(run_hash) = run_hashes.get(run_id) {
                        if run_hash != workflow_hash {
                            return Err(SessionStoreError::InvariantViolation(format!(
                                "node workflow hash {workflow_hash} diverges from run hash {run_hash}"
                            )));
                        }
                    }
                }
            }
            _ => {}
        }

        state.index_event(event);
    }
    Ok(())
}

/// Newline-terminated lines only; a torn trailing chunk is excluded and is
/// the caller's business to classify.
fn split_complete_lines(bytes: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (position, &byte) in bytes.iter().enumerate() {
        if byte == b'\n' {
            if position > start {
                lines.push(&bytes[start..position]);
            }
            start = position + 1;
        }
    }
    lines
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod log_tests;
