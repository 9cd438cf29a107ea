//! Exclusive lock file guarding state commits
//!
//! The lock is a file created with `create_new`; holding the guard means
//! owning the file. It is only held around commits, never across a network
//! call. A lock file left behind by a crashed run is broken after
//! [`STALE_AFTER`].

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::warn;

use crate::StateError;

/// Age after which an existing lock file is considered abandoned
pub const STALE_AFTER: Duration = Duration::from_secs(30);

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Guard for the state lock; released on drop
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, StateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(path) {
                        warn!(path = %path.display(), "Breaking stale state lock");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                }
                Err(e) => return Err(e.into()),
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(StateError::LockTimeout {
                    path: path.display().to_string(),
                    waited_ms: waited.as_millis(),
                });
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > STALE_AFTER)
        .unwrap_or(false)
}
