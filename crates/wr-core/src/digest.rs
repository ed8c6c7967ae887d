//! SHA-256 content digests and the short workflow-hash ref embedded in tokens.

use crate::canonical::{CanonicalJsonError, to_canonical_bytes};
use data_encoding::{Encoding, HEXLOWER, Specification};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use std::sync::LazyLock;

const DIGEST_PREFIX: &str = "sha256:";
const HASH_REF_PREFIX: &str = "wh1-";
const HASH_REF_HEX_LEN: usize = 16;

/// RFC 4648 base32, lowercase alphabet, no padding.
pub static BASE32_LOWER_NOPAD: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
    // The specification is a compile-time constant; it cannot be invalid.
    spec.encoding().expect("base32 lowercase specification")
});

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestParseError {
    #[error("digest '{0}' is missing the 'sha256:' prefix")]
    MissingPrefix(String),

    #[error("digest '{0}' is not 64 lowercase hex characters")]
    MalformedHex(String),

    #[error("hash ref '{0}' is not of the form 'wh1-<16 hex>'")]
    MalformedHashRef(String),
}

/// A SHA-256 digest rendered as `sha256:<64 lowercase hex>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(digest.into())
    }

    /// Digest of a JSON value's canonical encoding.
    pub fn of_canonical(value: &Value) -> Result<Self, CanonicalJsonError> {
        Ok(Self::of_bytes(&to_canonical_bytes(value)?))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    pub fn parse(text: &str) -> Result<Self, DigestParseError> {
        let hex = text
            .strip_prefix(DIGEST_PREFIX)
            .ok_or_else(|| DigestParseError::MissingPrefix(text.to_string()))?;
        if hex.len() != 64 {
            return Err(DigestParseError::MalformedHex(text.to_string()));
        }
        let bytes = HEXLOWER
            .decode(hex.as_bytes())
            .map_err(|_| DigestParseError::MalformedHex(text.to_string()))?;
        let mut out = [0_u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Short version-tagged ref for token embedding.
    pub fn hash_ref(&self) -> WorkflowHashRef {
        WorkflowHashRef(format!("{HASH_REF_PREFIX}{}", &self.to_hex()[..HASH_REF_HEX_LEN]))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{DIGEST_PREFIX}{}", self.to_hex())
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Short, version-tagged form of a workflow hash (`wh1-<16 hex>`).
///
/// Bound into tokens so scope checks stay cheap; the full digest lives in
/// events and snapshot keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowHashRef(String);

impl WorkflowHashRef {
    pub fn parse(text: &str) -> Result<Self, DigestParseError> {
        let hex = text
            .strip_prefix(HASH_REF_PREFIX)
            .ok_or_else(|| DigestParseError::MalformedHashRef(text.to_string()))?;
        if hex.len() != HASH_REF_HEX_LEN
            || !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(DigestParseError::MalformedHashRef(text.to_string()));
        }
        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this ref abbreviates the given digest.
    pub fn matches(&self, digest: &ContentDigest) -> bool {
        self == &digest.hash_ref()
    }
}

impl std::fmt::Display for WorkflowHashRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_display_and_parse_round_trip() {
        let digest = ContentDigest::of_bytes(b"workrail");
        let text = digest.to_string();
        assert!(text.starts_with("sha256:"));
        assert_eq!(text.len(), 7 + 64);
        assert_eq!(ContentDigest::parse(&text).unwrap(), digest);
    }

    #[test]
    fn test_known_vector() {
        // sha256("abc") from FIPS 180-2.
        let digest = ContentDigest::of_bytes(b"abc");
        assert_eq!(
            digest.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_parse_rejects_bad_inputs() {
        assert!(matches!(
            ContentDigest::parse("md5:abc"),
            Err(DigestParseError::MissingPrefix(_))
        ));
        assert!(matches!(
            ContentDigest::parse("sha256:zz"),
            Err(DigestParseError::MalformedHex(_))
        ));
        let upper = format!("sha256:{}", "A".repeat(64));
        assert!(matches!(
            ContentDigest::parse(&upper),
            Err(DigestParseError::MalformedHex(_))
        ));
    }

    #[test]
    fn test_of_canonical_is_order_insensitive() {
        let a = ContentDigest::of_canonical(&json!({"x": 1, "y": 2})).unwrap();
        let b = ContentDigest::of_canonical(&json!({"y": 2, "x": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_ref_shape_and_match() {
        let digest = ContentDigest::of_bytes(b"workrail");
        let hash_ref = digest.hash_ref();
        assert!(hash_ref.as_str().starts_with("wh1-"));
        assert_eq!(hash_ref.as_str().len(), 4 + 16);
        assert!(hash_ref.matches(&digest));
        assert!(!hash_ref.matches(&ContentDigest::of_bytes(b"other")));
    }

    #[test]
    fn test_hash_ref_parse() {
        let digest = ContentDigest::of_bytes(b"workrail");
        let text = digest.hash_ref().to_string();
        assert_eq!(WorkflowHashRef::parse(&text).unwrap().as_str(), text);
        assert!(WorkflowHashRef::parse("wh2-0123456789abcdef").is_err());
        assert!(WorkflowHashRef::parse("wh1-0123").is_err());
        assert!(WorkflowHashRef::parse("wh1-0123456789ABCDEF").is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let digest = ContentDigest::of_bytes(b"serde");
        let text = serde_json::to_string(&digest).unwrap();
        let back: ContentDigest = serde_json::from_str(&text).unwrap();
        assert_eq!(back, digest);
    }

    #[test]
    fn test_base32_lower_rfc4648_vectors() {
        assert_eq!(BASE32_LOWER_NOPAD.encode(b""), "");
        assert_eq!(BASE32_LOWER_NOPAD.encode(b"f"), "my");
        assert_eq!(BASE32_LOWER_NOPAD.encode(b"fo"), "mzxq");
        assert_eq!(BASE32_LOWER_NOPAD.encode(b"foo"), "mzxw6");
        assert_eq!(BASE32_LOWER_NOPAD.encode(b"foob"), "mzxw6yq");
        assert_eq!(BASE32_LOWER_NOPAD.encode(b"fooba"), "mzxw6ytb");
        assert_eq!(BASE32_LOWER_NOPAD.encode(b"foobar"), "mzxw6ytboi");
    }

    #[test]
    fn test_base32_lower_decode_round_trip() {
        let data = b"workrail token payload";
        let encoded = BASE32_LOWER_NOPAD.encode(data);
        assert_eq!(BASE32_LOWER_NOPAD.decode(encoded.as_bytes()).unwrap(), data);
    }
}
