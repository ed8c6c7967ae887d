//! Short opaque tokens binding a caller to (session, run, node, attempt).
//!
//! Wire format: `<prefix>.<version>.<base32(payload)>.<base32(hmac)>` with
//! prefixes `st` (state), `ack` (acknowledge), `chk` (checkpoint); base32 is
//! RFC 4648 lowercase without padding. The payload is the canonical JSON of
//! the token's fields, so signing is deterministic: identical payloads yield
//! identical tokens. Agents must treat tokens as opaque bytes.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use wr_core::{BASE32_LOWER_NOPAD, AttemptId, NodeId, RunId, SessionId, WorkflowHashRef};

type HmacSha256 = Hmac<Sha256>;

/// Version segment emitted and accepted by this codec.
pub const TOKEN_VERSION: &str = "1";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token format invalid: {0}")]
    InvalidFormat(String),

    #[error("token version '{0}' is not supported")]
    UnsupportedVersion(String),

    #[error("token signature verification failed")]
    BadSignature,

    #[error("token scope mismatch on {field}")]
    ScopeMismatch { field: &'static str },
}

/// Kind of token, keyed by wire prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    State,
    Ack,
    Checkpoint,
}

impl TokenKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::State => "st",
            Self::Ack => "ack",
            Self::Checkpoint => "chk",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "st" => Some(Self::State),
            "ack" => Some(Self::Ack),
            "chk" => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// Payload of a state token: where the caller believes execution stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StatePayload {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub workflow_hash_ref: WorkflowHashRef,
}

/// Payload of an ack or checkpoint token: permission for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AckPayload {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub attempt_id: AttemptId,
}

/// A parsed-but-not-yet-verified token.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    pub kind: TokenKind,
    payload_b32: String,
    payload_bytes: Vec<u8>,
    mac: Vec<u8>,
}

/// Signs and verifies tokens with one HMAC key.
#[derive(Clone)]
pub struct TokenCodec {
    key: Vec<u8>,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac_for(&self, kind: TokenKind, payload_b32: &str) -> Vec<u8> {
        // HMAC accepts any key length.
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac key");
        mac.update(kind.prefix().as_bytes());
        mac.update(b".");
        mac.update(TOKEN_VERSION.as_bytes());
        mac.update(b".");
        mac.update(payload_b32.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn sign_bytes(&self, kind: TokenKind, payload_bytes: &[u8]) -> String {
        let payload_b32 = BASE32_LOWER_NOPAD.encode(payload_bytes);
        let mac = self.mac_for(kind, &payload_b32);
        let mac_b32 = BASE32_LOWER_NOPAD.encode(&mac);
        format!("{}.{TOKEN_VERSION}.{payload_b32}.{mac_b32}", kind.prefix())
    }

    /// Sign a state token.
    pub fn sign_state(&self, payload: &StatePayload) -> String {
        self.sign_bytes(TokenKind::State, &canonical_payload(payload))
    }

    /// Sign an ack token.
    pub fn sign_ack(&self, payload: &AckPayload) -> String {
        self.sign_bytes(TokenKind::Ack, &canonical_payload(payload))
    }

    /// Sign a checkpoint token.
    pub fn sign_checkpoint(&self, payload: &AckPayload) -> String {
        self.sign_bytes(TokenKind::Checkpoint, &canonical_payload(payload))
    }

    /// Split a token into its parts without trusting it.
    pub fn parse(&self, token: &str) -> Result<ParsedToken, TokenError> {
        let mut parts = token.split('.');
        let (prefix, version, payload_b32, mac_b32) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(prefix), Some(version), Some(payload), Some(mac), None) => {
                (prefix, version, payload, mac)
            }
            _ => {
                return Err(TokenError::InvalidFormat(
                    "expected 4 dot-separated segments".to_string(),
                ));
            }
        };

        let kind = TokenKind::from_prefix(prefix)
            .ok_or_else(|| TokenError::InvalidFormat(format!("unknown prefix '{prefix}'")))?;
        if version != TOKEN_VERSION {
            return Err(TokenError::UnsupportedVersion(version.to_string()));
        }

        let payload_bytes = BASE32_LOWER_NOPAD
            .decode(payload_b32.as_bytes())
            .map_err(|_| TokenError::InvalidFormat("payload is not base32".to_string()))?;
        let mac = BASE32_LOWER_NOPAD
            .decode(mac_b32.as_bytes())
            .map_err(|_| TokenError::InvalidFormat("signature is not base32".to_string()))?;

        Ok(ParsedToken {
            kind,
            payload_b32: payload_b32.to_string(),
            payload_bytes,
            mac,
        })
    }

    /// Verify the HMAC of a parsed token in constant time.
    pub fn verify_signature(&self, parsed: &ParsedToken) -> Result<(), TokenError> {
        let expected = self.mac_for(parsed.kind, &parsed.payload_b32);
        if expected.ct_eq(&parsed.mac).into() {
            Ok(())
        } else {
            Err(TokenError::BadSignature)
        }
    }

    /// Parse, verify, and decode a state token.
    pub fn verify_state(&self, token: &str) -> Result<StatePayload, TokenError> {
        let parsed = self.parse(token)?;
        if parsed.kind != TokenKind::State {
            return Err(TokenError::InvalidFormat(
                "expected a state token".to_string(),
            ));
        }
        self.verify_signature(&parsed)?;
        decode_payload(&parsed.payload_bytes)
    }

    /// Parse, verify, and decode an ack token.
    pub fn verify_ack(&self, token: &str) -> Result<AckPayload, TokenError> {
        let parsed = self.parse(token)?;
        if parsed.kind != TokenKind::Ack {
            return Err(TokenError::InvalidFormat("expected an ack token".to_string()));
        }
        self.verify_signature(&parsed)?;
        decode_payload(&parsed.payload_bytes)
    }

    /// Parse, verify, and decode a checkpoint token.
    pub fn verify_checkpoint(&self, token: &str) -> Result<AckPayload, TokenError> {
        let parsed = self.parse(token)?;
        if parsed.kind != TokenKind::Checkpoint {
            return Err(TokenError::InvalidFormat(
                "expected a checkpoint token".to_string(),
            ));
        }
        self.verify_signature(&parsed)?;
        decode_payload(&parsed.payload_bytes)
    }
}

fn canonical_payload<T: Serialize>(payload: &T) -> Vec<u8> {
    // Token payloads are structs of plain strings; canonicalization cannot
    // fail for them.
    wr_core::canonical_bytes(payload).unwrap_or_default()
}

fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, TokenError> {
    serde_json::from_slice(bytes)
        .map_err(|err| TokenError::InvalidFormat(format!("payload does not decode: {err}")))
}

/// Require a state and an ack token to address the same scope.
pub fn assert_scope_matches(state: &StatePayload, ack: &AckPayload) -> Result<(), TokenError> {
    if state.session_id != ack.session_id {
        return Err(TokenError::ScopeMismatch { field: "sessionId" });
    }
    if state.run_id != ack.run_id {
        return Err(TokenError::ScopeMismatch { field: "runId" });
    }
    if state.node_id != ack.node_id {
        return Err(TokenError::ScopeMismatch { field: "nodeId" });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wr_core::ContentDigest;

    fn codec() -> TokenCodec {
        TokenCodec::new(b"test-key-0123456789".to_vec())
    }

    fn state_payload() -> StatePayload {
        StatePayload {
            session_id: SessionId::mint(),
            run_id: RunId::mint(),
            node_id: NodeId::mint(),
            workflow_hash_ref: ContentDigest::of_bytes(b"wf").hash_ref(),
        }
    }

    fn ack_payload_for(state: &StatePayload) -> AckPayload {
        AckPayload {
            session_id: state.session_id.clone(),
            run_id: state.run_id.clone(),
            node_id: state.node_id.clone(),
            attempt_id: AttemptId::mint(),
        }
    }

    #[test]
    fn test_sign_parse_round_trip() {
        let codec = codec();
        let payload = state_payload();
        let token = codec.sign_state(&payload);
        assert!(token.starts_with("st.1."));
        assert_eq!(codec.verify_state(&token).unwrap(), payload);
    }

    #[test]
    fn test_signing_is_deterministic() {
        let codec = codec();
        let payload = state_payload();
        assert_eq!(codec.sign_state(&payload), codec.sign_state(&payload));
    }

    #[test]
    fn test_ack_and_checkpoint_prefixes() {
        let codec = codec();
        let ack = ack_payload_for(&state_payload());
        assert!(codec.sign_ack(&ack).starts_with("ack.1."));
        assert!(codec.sign_checkpoint(&ack).starts_with("chk.1."));
    }

    #[test]
    fn test_kind_confusion_rejected() {
        let codec = codec();
        let ack = ack_payload_for(&state_payload());
        let chk_token = codec.sign_checkpoint(&ack);
        // A checkpoint token is not an ack token even with a valid mac.
        assert!(matches!(
            codec.verify_ack(&chk_token),
            Err(TokenError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_prefix_swap_breaks_signature() {
        let codec = codec();
        let ack = ack_payload_for(&state_payload());
        let token = codec.sign_ack(&ack);
        let swapped = format!("chk.{}", token.strip_prefix("ack.").unwrap());
        // Same payload re-prefixed: parses as checkpoint, but the mac was
        // domain-separated by prefix and must fail.
        assert_eq!(codec.verify_checkpoint(&swapped), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_mutated_payload_fails_signature() {
        let codec = codec();
        let token = codec.sign_state(&state_payload());
        let parts: Vec<&str> = token.split('.').collect();
        let mut payload = parts[2].to_string();
        // Flip one base32 symbol to another valid symbol.
        let original = payload.remove(0);
        let replacement = if original == 'a' { 'b' } else { 'a' };
        let mutated = format!("{}.{}.{}{}.{}", parts[0], parts[1], replacement, payload, parts[3]);
        assert_eq!(codec.verify_state(&mutated), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_truncated_token_is_invalid_format() {
        let codec = codec();
        let token = codec.sign_state(&state_payload());
        let truncated = token.rsplit_once('.').unwrap().0;
        assert!(matches!(
            codec.verify_state(truncated),
            Err(TokenError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let codec = codec();
        let token = codec.sign_state(&state_payload());
        let bumped = token.replacen(".1.", ".2.", 1);
        assert_eq!(
            codec.verify_state(&bumped),
            Err(TokenError::UnsupportedVersion("2".to_string()))
        );
    }

    #[test]
    fn test_unknown_prefix() {
        let codec = codec();
        let token = codec.sign_state(&state_payload());
        let renamed = format!("zz.{}", token.strip_prefix("st.").unwrap());
        assert!(matches!(
            codec.verify_state(&renamed),
            Err(TokenError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let token = codec().sign_state(&state_payload());
        let other = TokenCodec::new(b"another-key".to_vec());
        assert_eq!(other.verify_state(&token), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_scope_match() {
        let state = state_payload();
        let ack = ack_payload_for(&state);
        assert!(assert_scope_matches(&state, &ack).is_ok());

        let mut wrong_node = ack.clone();
        wrong_node.node_id = NodeId::mint();
        assert_eq!(
            assert_scope_matches(&state, &wrong_node),
            Err(TokenError::ScopeMismatch { field: "nodeId" })
        );

        let mut wrong_run = ack.clone();
        wrong_run.run_id = RunId::mint();
        assert_eq!(
            assert_scope_matches(&state, &wrong_run),
            Err(TokenError::ScopeMismatch { field: "runId" })
        );

        let mut wrong_session = ack;
        wrong_session.session_id = SessionId::mint();
        assert_eq!(
            assert_scope_matches(&state, &wrong_session),
            Err(TokenError::ScopeMismatch { field: "sessionId" })
        );
    }

    #[test]
    fn test_token_is_lowercase_base32_segments() {
        let codec = codec();
        let token = codec.sign_state(&state_payload());
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 4);
        for segment in &parts[2..] {
            assert!(
                segment
                    .chars()
                    .all(|c| matches!(c, 'a'..='z' | '2'..='7')),
                "segment not lowercase base32: {segment}"
            );
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            // Flipping any single payload symbol must never verify.
            #[test]
            fn payload_mutation_never_verifies(position in 0_usize..8, symbol in 0_usize..32) {
                let codec = TokenCodec::new(b"prop-key".to_vec());
                let payload = StatePayload {
                    session_id: SessionId::parse("01HY7ABCDEFGHJKMNPQRSTVWXY").unwrap(),
                    run_id: RunId::parse("01HY7ABCDEFGHJKMNPQRSTVWX0").unwrap(),
                    node_id: NodeId::parse("01HY7ABCDEFGHJKMNPQRSTVWX1").unwrap(),
                    workflow_hash_ref: ContentDigest::of_bytes(b"wf").hash_ref(),
                };
                let token = codec.sign_state(&payload);
                let parts: Vec<&str> = token.split('.').collect();
                let alphabet: Vec<char> = "abcdefghijklmnopqrstuvwxyz234567".chars().collect();

                let mut payload_chars: Vec<char> = parts[2].chars().collect();
                let target = position % payload_chars.len();
                let replacement = alphabet[symbol];
                prop_assume!(payload_chars[target] != replacement);
                payload_chars[target] = replacement;
                let mutated: String = payload_chars.into_iter().collect();
                let rebuilt = format!("{}.{}.{}.{}", parts[0], parts[1], mutated, parts[3]);

                prop_assert!(codec.verify_state(&rebuilt).is_err());
            }
        }
    }
}
