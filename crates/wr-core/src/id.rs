//! ULID-backed identifiers for sessions, runs, nodes, and attempts.

use crate::digest::BASE32_LOWER_NOPAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

const ID_LENGTH: usize = 26;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid {kind} '{value}': expected 26 characters, got {actual}")]
    WrongLength {
        kind: &'static str,
        value: String,
        actual: usize,
    },

    #[error("invalid {kind} '{value}': not a valid ULID")]
    NotUlid { kind: &'static str, value: String },

    #[error("invalid attempt id '{0}': expected 26 uppercase base32 characters")]
    MalformedAttempt(String),
}

macro_rules! ulid_id {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh identifier.
            pub fn mint() -> Self {
                Self(ulid::Ulid::new().to_string())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                if value.len() != ID_LENGTH {
                    return Err(IdParseError::WrongLength {
                        kind: $kind,
                        value: value.to_string(),
                        actual: value.len(),
                    });
                }
                ulid::Ulid::from_string(value).map_err(|_| IdParseError::NotUlid {
                    kind: $kind,
                    value: value.to_string(),
                })?;
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

ulid_id!(
    /// Identifies one durable session directory.
    SessionId,
    "session id"
);
ulid_id!(
    /// Identifies one run of a pinned workflow within a session.
    RunId,
    "run id"
);
ulid_id!(
    /// Identifies an addressable node in the execution DAG.
    NodeId,
    "node id"
);

/// Identifies one advance attempt at a node.
///
/// The first attempt of a node is minted fresh; every follow-up attempt is
/// derived deterministically so that replaying an advance re-mints the same
/// tokens.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(String);

impl AttemptId {
    pub fn mint() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn parse(value: &str) -> Result<Self, IdParseError> {
        let valid = value.len() == ID_LENGTH
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase());
        if !valid {
            return Err(IdParseError::MalformedAttempt(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The attempt id for the node created by a successful advance on `self`.
    pub fn derive_next(&self) -> Self {
        Self::derive(&format!("wr-attempt:{}", self.0))
    }

    /// A fork attempt minted when rehydrating at a non-tip node.
    ///
    /// `fork_ordinal` is the number of children the node had at rehydrate
    /// time, which keeps the derivation deterministic for a given log state.
    pub fn derive_fork(&self, fork_ordinal: usize) -> Self {
        Self::derive(&format!("wr-attempt:{}:fork:{fork_ordinal}", self.0))
    }

    /// The attempt id of the checkpoint node recorded for this attempt.
    pub fn derive_checkpoint(&self) -> Self {
        Self::derive(&format!("wr-attempt:{}:checkpoint", self.0))
    }

    fn derive(payload: &str) -> Self {
        let digest = Sha256::digest(payload.as_bytes());
        let encoded = BASE32_LOWER_NOPAD.encode(&digest).to_ascii_uppercase();
        Self(encoded[..ID_LENGTH].to_string())
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
