//! Event segment files: `events/<firstIdx>-<lastIdx>.jsonl`.

use crate::event::EventEnvelope;
use data_encoding::HEXLOWER;
use sha2::{Digest as _, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name a segment covering the inclusive index range.
pub fn segment_file_name(first_index: u64, last_index: u64) -> String {
    format!("{first_index}-{last_index}.jsonl")
}

/// Parse a segment file name back into its index range.
pub fn parse_segment_file_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".jsonl")?;
    let (first, last) = stem.split_once('-')?;
    let first: u64 = first.parse().ok()?;
    let last: u64 = last.parse().ok()?;
    (first <= last).then_some((first, last))
}

/// Serialize events to JSONL bytes (one envelope per line).
pub fn encode_segment(events: &[EventEnvelope]) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::with_capacity(events.len() * 256);
    for event in events {
        serde_json::to_writer(&mut out, event)?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Lowercase hex SHA-256 of segment bytes, as attested by the manifest.
pub fn segment_sha256(bytes: &[u8]) -> String {
    HEXLOWER.encode(&Sha256::digest(bytes))
}

/// Write segment bytes atomically: temp file, fsync, rename, fsync dir.
pub fn write_segment_atomic(
    events_dir: &Path,
    file_name: &str,
    bytes: &[u8],
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(events_dir)?;

    let tmp_path = events_dir.join(format!(".tmp-{file_name}"));
    let final_path = events_dir.join(file_name);

    let mut tmp = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }
    tmp.write_all(bytes)?;
    tmp.sync_all()?;
    drop(tmp);

    std::fs::rename(&tmp_path, &final_path)?;
    fsync_dir(events_dir)?;
    Ok(final_path)
}

/// Durably flush a directory entry (required after rename on unix).
pub fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}
