//! Per-transcript offset store
//!
//! One JSON file maps each transcript path to the byte offset up to which
//! its records have been emitted. Advancing that offset is what prevents
//! duplicate traces, so [`OffsetStore::commit`] is only called after the
//! backend accepted a run's batch.
//!
//! A missing or unreadable file loads as "start from the beginning".
//! Already-sent turns are then emitted again under the same ids.

use cctrace_core::TraceShape;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::lock::StateLock;
use crate::{write_atomic, StateError};

/// Offset file format version
pub const OFFSETS_VERSION: u32 = 1;

/// A partial turn that may still grow; re-read from its user record next time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTurn {
    /// Byte offset of the turn's user record
    pub byte_offset: u64,
    pub turn_number: u64,
    pub turn_id: String,
    /// Shape it was emitted in; re-emissions keep it
    #[serde(default)]
    pub shape: Option<TraceShape>,
}

/// Progress for one transcript file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub file_path: String,
    pub byte_offset: u64,
    #[serde(default)]
    pub last_session_id: Option<String>,
    /// Turns numbered so far in this transcript
    #[serde(default)]
    pub turn_count: u64,
    #[serde(default)]
    pub open_turn: Option<OpenTurn>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OffsetRecord {
    pub fn new(file_path: &Path) -> Self {
        Self {
            file_path: key_for(file_path),
            ..Default::default()
        }
    }
}

/// Result of a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Written,
    /// Another run advanced this transcript further in the meantime
    Superseded,
}

#[derive(Debug, Serialize, Deserialize)]
struct OffsetFile {
    version: u32,
    #[serde(default)]
    transcripts: BTreeMap<String, OffsetRecord>,
}

impl Default for OffsetFile {
    fn default() -> Self {
        Self {
            version: OFFSETS_VERSION,
            transcripts: BTreeMap::new(),
        }
    }
}

fn key_for(file_path: &Path) -> String {
    file_path.to_string_lossy().to_string()
}

/// Offset store backed by a single JSON file
pub struct OffsetStore {
    path: PathBuf,
}

impl OffsetStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> OffsetFile {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return OffsetFile::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Offset store unreadable, starting from beginning");
                return OffsetFile::default();
            }
        };
        match serde_json::from_str::<OffsetFile>(&raw) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Offset store corrupted, starting from beginning");
                OffsetFile::default()
            }
        }
    }

    fn write_file(&self, file: &OffsetFile) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(file)?;
        write_atomic(&self.path, &json)
    }

    /// Stored record for a transcript; offset 0 when unknown
    pub fn load(&self, file_path: &Path) -> OffsetRecord {
        let key = key_for(file_path);
        self.read_file()
            .transcripts
            .remove(&key)
            .unwrap_or_else(|| OffsetRecord::new(file_path))
    }

    /// All stored records, ordered by path
    pub fn all(&self) -> Vec<OffsetRecord> {
        self.read_file().transcripts.into_values().collect()
    }

    /// Persist `record` if the stored offset still equals `expected_previous`
    /// or is not ahead of the new one.
    ///
    /// Re-committing the same record is a no-op write.
    pub fn commit(
        &self,
        _lock: &StateLock,
        record: &OffsetRecord,
        expected_previous: u64,
    ) -> Result<CommitOutcome, StateError> {
        let mut file = self.read_file();
        if let Some(current) = file.transcripts.get(&record.file_path) {
            if current.byte_offset != expected_previous && current.byte_offset > record.byte_offset {
                debug!(
                    file = %record.file_path,
                    stored = current.byte_offset,
                    ours = record.byte_offset,
                    "Offset already advanced by another run"
                );
                return Ok(CommitOutcome::Superseded);
            }
        }

        let mut record = record.clone();
        record.updated_at = Some(Utc::now());
        file.version = OFFSETS_VERSION;
        file.transcripts.insert(record.file_path.clone(), record);
        self.write_file(&file)?;
        Ok(CommitOutcome::Written)
    }

    /// Forget one transcript. Returns whether it was known.
    pub fn remove(&self, _lock: &StateLock, file_path: &Path) -> Result<bool, StateError> {
        let mut file = self.read_file();
        let removed = file.transcripts.remove(&key_for(file_path)).is_some();
        if removed {
            self.write_file(&file)?;
        }
        Ok(removed)
    }

    /// Delete the whole offset file
    pub fn clear(&self, _lock: &StateLock) -> Result<(), StateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
