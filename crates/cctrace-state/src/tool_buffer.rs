//! Persisted queue of tool events waiting for a turn
//!
//! PreToolUse/PostToolUse runs append one JSON line per event and keep the
//! file under a hard size bound. Stop and Notification runs read every
//! buffered event, and after a successful emission remove the ones they
//! consumed (matched, or sent standalone once stale).

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use cctrace_core::ToolEvent;
use tracing::warn;

use crate::lock::StateLock;
use crate::{write_atomic, StateError};

/// JSONL-backed tool event buffer
pub struct ToolBuffer {
    path: PathBuf,
}

impl ToolBuffer {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event
    pub fn append(&self, _lock: &StateLock, event: &ToolEvent) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Keep only the newest `limit` events. Returns how many were dropped.
    pub fn trim_oldest(&self, _lock: &StateLock, limit: usize) -> Result<usize, StateError> {
        let events = self.load_all()?;
        if events.len() <= limit {
            return Ok(0);
        }
        let dropped = events.len() - limit;
        let mut out = String::new();
        for event in &events[dropped..] {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        write_atomic(&self.path, out.as_bytes())?;
        Ok(dropped)
    }

    /// Every buffered event in arrival order. Unreadable lines are skipped.
    pub fn load_all(&self) -> Result<Vec<ToolEvent>, StateError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for (i, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ToolEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(line = i + 1, error = %e, "Skipping unreadable buffered tool event"),
            }
        }
        Ok(events)
    }

    /// Drop the given event ids. Events appended since they were loaded are kept.
    pub fn remove(&self, _lock: &StateLock, ids: &HashSet<String>) -> Result<usize, StateError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let events = self.load_all()?;
        let before = events.len();
        let kept: Vec<&ToolEvent> = events.iter().filter(|e| !ids.contains(&e.id)).collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut out = String::new();
        for event in kept {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        write_atomic(&self.path, out.as_bytes())?;
        Ok(removed)
    }

    pub fn clear(&self, _lock: &StateLock) -> Result<(), StateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
