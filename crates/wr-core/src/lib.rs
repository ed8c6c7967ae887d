//! Shared primitives: identifiers, canonical JSON, content digests.

pub mod canonical;
pub mod digest;
pub mod id;
pub mod prefs;

pub use canonical::{CanonicalJsonError, canonical_bytes, to_canonical_bytes};
pub use digest::{BASE32_LOWER_NOPAD, ContentDigest, DigestParseError, WorkflowHashRef};
pub use id::{AttemptId, IdParseError, NodeId, RunId, SessionId};
pub use prefs::{Autonomy, Preferences, RiskPolicy};
