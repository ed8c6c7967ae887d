//! Append-only manifest attesting committed segments and snapshot pins.
//!
//! The manifest is the commit record of the session log: a segment's events
//! are truth only once a `segment_closed` record for it is durable, and a
//! snapshot ref is trusted only once a `snapshot_pinned` record appears
//! after the `segment_closed` of the segment that introduced it.

use crate::event::EventId;
use serde::{Deserialize, Serialize};
use wr_core::ContentDigest;

/// Manifest record schema version.
pub const MANIFEST_SCHEMA_VERSION: u8 = 1;

/// Attestation that one snapshot ref referenced by an event is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPin {
    pub snapshot_ref: ContentDigest,
    pub event_index: u64,
    pub created_by_event_id: EventId,
}

/// The closed set of manifest record kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum ManifestRecordBody {
    #[serde(rename_all = "camelCase")]
    SegmentClosed {
        /// File name under `events/`, e.g. `0-3.jsonl`.
        segment: String,
        /// Exact byte length of the committed segment file.
        bytes: u64,
        /// Lowercase hex SHA-256 of the segment bytes.
        sha256: String,
    },

    #[serde(rename_all = "camelCase")]
    SnapshotPinned(SnapshotPin),
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub v: u8,

    #[serde(flatten)]
    pub body: ManifestRecordBody,
}

impl ManifestRecord {
    pub fn segment_closed(segment: String, bytes: u64, sha256: String) -> Self {
        Self {
            v: MANIFEST_SCHEMA_VERSION,
            body: ManifestRecordBody::SegmentClosed {
                segment,
                bytes,
                sha256,
            },
        }
    }

    pub fn snapshot_pinned(pin: SnapshotPin) -> Self {
        Self {
            v: MANIFEST_SCHEMA_VERSION,
            body: ManifestRecordBody::SnapshotPinned(pin),
        }
    }
}
