//! Detected backend shape, remembered between runs
//!
//! The shape is probed once per base URL and reused afterwards, so a run
//! makes a single network call and a backend hiccup never flips a
//! transcript's traces from one shape to the other.

use cctrace_core::TraceShape;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::lock::StateLock;
use crate::{write_atomic, StateError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRecord {
    pub base_url: String,
    pub shape: TraceShape,
    #[serde(default)]
    pub version: Option<String>,
    pub probed_at: DateTime<Utc>,
}

/// Single-record JSON file
pub struct BackendStore {
    path: PathBuf,
}

impl BackendStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored record, if there is one for this base URL
    pub fn load(&self, base_url: &str) -> Option<BackendRecord> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Backend record unreadable");
                return None;
            }
        };
        match serde_json::from_str::<BackendRecord>(&raw) {
            Ok(record) if record.base_url == base_url => Some(record),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Backend record corrupted, probing again");
                None
            }
        }
    }

    pub fn save(&self, _lock: &StateLock, record: &BackendRecord) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.path, &json)
    }

    pub fn clear(&self, _lock: &StateLock) -> Result<(), StateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn record(base_url: &str) -> BackendRecord {
        BackendRecord {
            base_url: base_url.to_string(),
            shape: TraceShape::Nested,
            version: Some("3.1.0".into()),
            probed_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_is_keyed_by_base_url() {
        let dir = TempDir::new().unwrap();
        let store = BackendStore::new(&dir.path().join("backend.json"));
        let lock = StateLock::acquire(&dir.path().join("lock"), Duration::from_secs(1)).unwrap();
        assert!(store.load("https://a.example").is_none());

        store.save(&lock, &record("https://a.example")).unwrap();
        assert_eq!(store.load("https://a.example").unwrap().shape, TraceShape::Nested);
        assert!(store.load("https://b.example").is_none());

        store.clear(&lock).unwrap();
        assert!(store.load("https://a.example").is_none());
    }

    #[test]
    fn test_corrupted_record_ignored() {
        let dir = TempDir::new().unwrap();
        let store = BackendStore::new(&dir.path().join("backend.json"));
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(store.load("https://a.example").is_none());
    }
}
