//! Content-addressed snapshot storage.
//!
//! Stores execution snapshots and pinned compiled workflows as canonical
//! JSON blobs keyed by their own SHA-256. Absence is not an error at this
//! layer; callers decide what a missing ref means.

use crate::segment::fsync_dir;
use serde_json::Value;
use std::path::{Path, PathBuf};
use wr_core::{CanonicalJsonError, ContentDigest, to_canonical_bytes};

#[derive(thiserror::Error, Debug)]
pub enum SnapshotStoreError {
    #[error("snapshot store io failure ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot body is not canonicalizable: {0}")]
    Encode(#[from] CanonicalJsonError),

    #[error("stored blob for {digest} fails verification")]
    CorruptBlob { digest: ContentDigest },
}

/// Blob store rooted at `<dataDir>/snapshots`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("snapshots"),
        }
    }

    fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        self.root.join(digest.to_hex())
    }

    /// Store a snapshot body, returning its content digest.
    ///
    /// Writing is atomic (temp + rename); an already-present blob is left
    /// untouched, which makes `put` idempotent.
    pub fn put(&self, body: &Value) -> Result<ContentDigest, SnapshotStoreError> {
        let bytes = to_canonical_bytes(body)?;
        let digest = ContentDigest::of_bytes(&bytes);
        let final_path = self.blob_path(&digest);
        if final_path.exists() {
            return Ok(digest);
        }

        let io = |context: &str| {
            let context = context.to_string();
            move |source| SnapshotStoreError::Io { context, source }
        };

        std::fs::create_dir_all(&self.root).map_err(io("creating snapshots dir"))?;
        let tmp_path = self.root.join(format!(".tmp-{}", digest.to_hex()));
        std::fs::write(&tmp_path, &bytes).map_err(io("writing snapshot temp file"))?;
        std::fs::rename(&tmp_path, &final_path).map_err(io("renaming snapshot"))?;
        fsync_dir(&self.root).map_err(io("flushing snapshots dir"))?;
        Ok(digest)
    }

    /// Fetch a snapshot body by digest. `None` when absent.
    pub fn get(&self, digest: &ContentDigest) -> Result<Option<Value>, SnapshotStoreError> {
        let path = self.blob_path(digest);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SnapshotStoreError::Io {
                    context: format!("reading snapshot {digest}"),
                    source,
                });
            }
        };

        if ContentDigest::of_bytes(&bytes) != *digest {
            return Err(SnapshotStoreError::CorruptBlob { digest: *digest });
        }
        let value = serde_json::from_slice(&bytes)
            .map_err(|_| SnapshotStoreError::CorruptBlob { digest: *digest })?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_round_trip() {
        let tmp = tempdir().unwrap();
        let store = SnapshotStore::new(tmp.path());

        let body = json!({"state": {"kind": "init"}, "workflowHash": "sha256:00"});
        let digest = store.put(&body).unwrap();
        let loaded = store.get(&digest).unwrap().unwrap();
        assert_eq!(loaded, body);
    }

    #[test]
    fn test_put_is_content_addressed_and_idempotent() {
        let tmp = tempdir().unwrap();
        let store = SnapshotStore::new(tmp.path());

        let a = store.put(&json!({"x": 1, "y": 2})).unwrap();
        // Key order does not matter; canonical bytes decide the address.
        let b = store.put(&json!({"y": 2, "x": 1})).unwrap();
        assert_eq!(a, b);

        let blobs = std::fs::read_dir(tmp.path().join("snapshots")).unwrap().count();
        assert_eq!(blobs, 1);
    }

    #[test]
    fn test_get_absent_is_none() {
        let tmp = tempdir().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let digest = ContentDigest::of_bytes(b"never stored");
        assert!(store.get(&digest).unwrap().is_none());
    }

    #[test]
    fn test_tampered_blob_is_corrupt() {
        let tmp = tempdir().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let digest = store.put(&json!({"a": 1})).unwrap();

        let path = tmp.path().join("snapshots").join(digest.to_hex());
        std::fs::write(&path, b"{\"a\":2}").unwrap();

        let err = store.get(&digest).unwrap_err();
        assert!(matches!(err, SnapshotStoreError::CorruptBlob { .. }));
    }

    #[test]
    fn test_rewritten_blob_keeps_single_entry() {
        let tmp = tempdir().unwrap();
        let store = SnapshotStore::new(tmp.path());
        let body = json!({"state": "running"});
        let first = store.put(&body).unwrap();
        let second = store.put(&body).unwrap();
        assert_eq!(first, second);
        let entries = std::fs::read_dir(tmp.path().join("snapshots")).unwrap().count();
        assert_eq!(entries, 1);
    }
}
