//! cctrace-state - Local state for the Claude Code trace pipeline
//!
//! This crate owns everything the pipeline keeps on disk between runs:
//! per-transcript offsets, the buffered tool event queue, the detected
//! backend shape and the lock that serializes commits. It also reads new
//! transcript records past a stored offset. All files live in one state
//! directory (`~/.claude/state` by default) and are safe to delete to force
//! a cold restart.

pub mod backend;
pub mod lock;
pub mod offsets;
pub mod paths;
pub mod reader;
pub mod tool_buffer;

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

pub use backend::{BackendRecord, BackendStore};
pub use lock::StateLock;
pub use offsets::{CommitOutcome, OffsetRecord, OffsetStore, OpenTurn};
pub use paths::{default_state_dir, state_dir_under, StatePaths};
pub use reader::{read_new, transcript_len, NewRecords, ReadOutcome};
pub use tool_buffer::ToolBuffer;

/// State errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out after {waited_ms}ms waiting for lock {path}")]
    LockTimeout { path: String, waited_ms: u128 },
}

/// Default time to wait for the state lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle on the state directory for one run
pub struct StateStore {
    paths: StatePaths,
}

impl StateStore {
    /// Open the state directory, creating it if needed
    pub fn open(dir: &Path) -> Result<Self, StateError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            paths: StatePaths::new(dir),
        })
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Take the exclusive commit lock
    pub fn lock(&self) -> Result<StateLock, StateError> {
        StateLock::acquire(&self.paths.lock, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn offsets(&self) -> OffsetStore {
        OffsetStore::new(&self.paths.offsets)
    }

    pub fn tool_buffer(&self) -> ToolBuffer {
        ToolBuffer::new(&self.paths.buffer)
    }

    pub fn backend(&self) -> BackendStore {
        BackendStore::new(&self.paths.backend)
    }
}

/// Write `contents` to `path` atomically: temp file in the same directory,
/// fsync, rename over the target.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut file = File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_directory() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join("nested").join("state");
        let store = StateStore::open(&state_dir).unwrap();
        assert!(state_dir.is_dir());
        assert_eq!(store.paths().dir, state_dir);
    }

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("state.json");
        write_atomic(&target, b"one").unwrap();
        write_atomic(&target, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "two");
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
