//! Single-writer session locking using `flock(2)` directly.
//!
//! Uses raw `libc::flock` instead of RAII lock wrappers to avoid the
//! self-referential struct problem: an RAII guard borrows the lock owner,
//! making it impossible to store both in the same struct without lifetime
//! gymnastics. By calling `flock(2)` directly we only need to own the
//! `File` (which owns the fd); `Drop` calls `flock(fd, LOCK_UN)`.
//!
//! flock conflicts between distinct open file descriptions, including two
//! opens inside one process, so same-process re-acquisition would surface as
//! a confusing "busy". A process-local registry of held lock paths turns
//! that case into the fatal reentrancy error instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// Suggested wait before retrying a busy lock.
pub const LOCK_RETRY_HINT_MS: u64 = 250;

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("session lock is busy: {holder}")]
    Busy { holder: String },

    #[error("session lock at '{0}' is already held by this process")]
    Reentrant(PathBuf),

    #[error("lock file io failure at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Diagnostic information written into the lock file while held.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockDiagnostic {
    pid: u32,
    host: String,
    acquired_at: DateTime<Utc>,
    reason: String,
}

fn held_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive session lock guard backed by `flock(2)`.
///
/// Holds the open `File` whose fd carries the advisory lock. On `Drop` the
/// lock is explicitly released via `flock(fd, LOCK_UN)` and the path is
/// removed from the process-local registry.
pub struct SessionLock {
    file: File,
    lock_path: PathBuf,
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // SAFETY: `fd` is a valid file descriptor owned by `self.file`.
        // `LOCK_UN` releases the advisory lock; if the call fails the lock is
        // still released when the fd closes moments later.
        unsafe {
            libc::flock(fd, libc::LOCK_UN);
        }
        if let Ok(mut held) = held_paths().lock() {
            held.remove(&self.lock_path);
        }
        tracing::debug!(lock_path = %self.lock_path.display(), "session lock released");
    }
}

impl SessionLock {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

/// Acquire the non-blocking exclusive lock for a session directory.
///
/// The lock file lives at `{session_dir}/lock`. On success the file carries
/// diagnostic JSON (pid, host, acquired-at, reason) so a busy peer can report
/// who holds it. Re-acquisition from the same process is rejected as
/// [`LockError::Reentrant`] before the filesystem is touched.
pub fn acquire_session_lock(session_dir: &Path, reason: &str) -> Result<SessionLock, LockError> {
    std::fs::create_dir_all(session_dir).map_err(|source| LockError::Io {
        path: session_dir.to_path_buf(),
        source,
    })?;
    let lock_path = session_dir.join("lock");

    {
        let mut held = held_paths().lock().unwrap_or_else(|poison| poison.into_inner());
        if !held.insert(lock_path.clone()) {
            return Err(LockError::Reentrant(lock_path));
        }
    }

    match try_flock(&lock_path, reason) {
        Ok(lock) => Ok(lock),
        Err(err) => {
            if let Ok(mut held) = held_paths().lock() {
                held.remove(&lock_path);
            }
            Err(err)
        }
    }
}

fn try_flock(lock_path: &Path, reason: &str) -> Result<SessionLock, LockError> {
    let io_err = |source| LockError::Io {
        path: lock_path.to_path_buf(),
        source,
    };

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(io_err)?;

    let fd = file.as_raw_fd();
    // SAFETY: `fd` is a valid file descriptor from the `File` we just opened.
    // `LOCK_EX | LOCK_NB` requests an exclusive non-blocking lock.
    let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

    if ret != 0 {
        return Err(LockError::Busy {
            holder: read_holder_diagnostic(lock_path),
        });
    }

    let mut lock = SessionLock {
        file,
        lock_path: lock_path.to_path_buf(),
    };

    let diagnostic = LockDiagnostic {
        pid: std::process::id(),
        host: hostname(),
        acquired_at: Utc::now(),
        reason: reason.to_string(),
    };
    // Serializing a struct of plain strings cannot fail.
    let json = serde_json::to_string(&diagnostic).unwrap_or_default();

    lock.file.set_len(0).map_err(io_err)?;
    lock.file.write_all(json.as_bytes()).map_err(io_err)?;
    lock.file.flush().map_err(io_err)?;

    tracing::debug!(lock_path = %lock_path.display(), reason, "session lock acquired");
    Ok(lock)
}

fn read_holder_diagnostic(lock_path: &Path) -> String {
    let mut contents = String::new();
    let read = File::open(lock_path).and_then(|mut f| f.read_to_string(&mut contents));
    if read.is_err() {
        return "held by another process (diagnostic unreadable)".to_string();
    }
    match serde_json::from_str::<LockDiagnostic>(&contents) {
        Ok(diag) => format!(
            "held by pid {} on {} since {} ({})",
            diag.pid, diag.host, diag.acquired_at, diag.reason
        ),
        Err(_) => "held by another process (diagnostic unreadable)".to_string(),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
