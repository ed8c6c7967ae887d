//! Data-directory resolution and the persistent token signing key.

use rand::Rng;
use std::io::Write;
use std::path::{Path, PathBuf};

/// The single environment variable the core layer reads.
pub const DATA_DIR_ENV: &str = "WORKRAIL_DATA_DIR";

const TOKEN_KEY_FILE: &str = "token.key";
const TOKEN_KEY_LEN: usize = 32;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("no data directory: set {DATA_DIR_ENV} or run on a platform with a state dir")]
    NoDataDir,

    #[error("data directory io failure ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Resolve the data directory root.
///
/// `WORKRAIL_DATA_DIR` wins; otherwise the platform state directory
/// (falling back to the local data directory on platforms without one).
pub fn resolve_data_dir(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let dirs =
        directories::ProjectDirs::from("", "", "workrail").ok_or(ConfigError::NoDataDir)?;
    let state_dir = dirs.state_dir().unwrap_or_else(|| dirs.data_local_dir());
    Ok(state_dir.to_path_buf())
}

/// Load the HMAC signing key, creating it on first use.
///
/// The key persists next to the session data so tokens verify across
/// process restarts. File mode is 0600 on unix.
pub fn load_or_create_token_key(data_dir: &Path) -> Result<Vec<u8>, ConfigError> {
    let io = |context: &str| {
        let context = context.to_string();
        move |source| ConfigError::Io { context, source }
    };

    let key_path = data_dir.join(TOKEN_KEY_FILE);
    match std::fs::read(&key_path) {
        Ok(key) if key.len() == TOKEN_KEY_LEN => return Ok(key),
        Ok(_) => {
            // Wrong length means a foreign or truncated file; refuse to
            // guess and regenerate below under a fresh write.
            tracing::warn!(path = %key_path.display(), "token key has wrong length; regenerating");
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(io("reading token key")(err)),
    }

    std::fs::create_dir_all(data_dir).map_err(io("creating data dir"))?;
    let key: [u8; TOKEN_KEY_LEN] = rand::thread_rng().r#gen();

    let tmp_path = data_dir.join(".tmp-token.key");
    let mut file = std::fs::File::create(&tmp_path).map_err(io("creating token key"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .map_err(io("restricting token key permissions"))?;
    }
    file.write_all(&key).map_err(io("writing token key"))?;
    file.sync_all().map_err(io("flushing token key"))?;
    drop(file);
    std::fs::rename(&tmp_path, &key_path).map_err(io("installing token key"))?;

    Ok(key.to_vec())
}
