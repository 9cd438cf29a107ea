//! Reset command - delete state to force a cold restart

use std::path::PathBuf;

use anyhow::Result;
use serde_json::json;

use cctrace_state::StateStore;

use crate::cli::{Cli, OutputFormat};
use crate::output::{self, colors};

/// What a reset removed
#[derive(Debug, Default, PartialEq, Eq)]
struct Removed {
    transcript: Option<bool>,
    offsets: bool,
    buffer: bool,
    backend: bool,
}

fn reset(store: &StateStore, transcript: Option<&PathBuf>, buffer_only: bool) -> Result<Removed> {
    let lock = store.lock()?;
    let mut removed = Removed::default();
    match (transcript, buffer_only) {
        (Some(path), _) => {
            removed.transcript = Some(store.offsets().remove(&lock, path)?);
        }
        (None, true) => {
            store.tool_buffer().clear(&lock)?;
            removed.buffer = true;
        }
        (None, false) => {
            store.offsets().clear(&lock)?;
            store.tool_buffer().clear(&lock)?;
            store.backend().clear(&lock)?;
            removed.offsets = true;
            removed.buffer = true;
            removed.backend = true;
        }
    }
    Ok(removed)
}

pub fn run(cli: &Cli, transcript: Option<&PathBuf>, buffer_only: bool) -> Result<()> {
    let store = StateStore::open(&cli.settings.state_dir()?)?;
    let removed = reset(&store, transcript, buffer_only)?;

    if cli.effective_format() == OutputFormat::Json {
        let output = json!({
            "transcript": transcript,
            "transcript_removed": removed.transcript,
            "offsets_cleared": removed.offsets,
            "buffer_cleared": removed.buffer,
            "backend_cleared": removed.backend,
        });
        return output::print_json(cli, &output);
    }

    match (transcript, removed.transcript) {
        (Some(path), Some(true)) => println!(
            "{}",
            colors::success(&format!("Forgot offset for {}", path.display()))
        ),
        (Some(path), _) => println!(
            "{}",
            colors::warning(&format!("No offset stored for {}", path.display()))
        ),
        (None, _) => {
            if removed.offsets {
                println!("{}", colors::success("Cleared all transcript offsets"));
            }
            if removed.buffer {
                println!("{}", colors::success("Cleared the tool event buffer"));
            }
            if removed.backend {
                println!("{}", colors::success("Forgot the detected backend shape"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cctrace_core::{ToolEvent, ToolPhase, TraceShape};
    use cctrace_state::{BackendRecord, OffsetRecord};
    use chrono::Utc;
    use tempfile::TempDir;

    fn seeded() -> (TempDir, StateStore, PathBuf) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let transcript = dir.path().join("t.jsonl");
        {
            let lock = store.lock().unwrap();
            let mut record = OffsetRecord::new(&transcript);
            record.byte_offset = 42;
            store.offsets().commit(&lock, &record, 0).unwrap();
            store
                .tool_buffer()
                .append(&lock, &ToolEvent::new("e1", "s1", "Bash", ToolPhase::Before, Utc::now()))
                .unwrap();
            let backend = BackendRecord {
                base_url: "http://localhost:3000".into(),
                shape: TraceShape::Nested,
                version: Some("3.2.0".into()),
                probed_at: Utc::now(),
            };
            store.backend().save(&lock, &backend).unwrap();
        }
        (dir, store, transcript)
    }

    #[test]
    fn test_reset_one_transcript() {
        let (_dir, store, transcript) = seeded();
        let removed = reset(&store, Some(&transcript), false).unwrap();
        assert_eq!(removed.transcript, Some(true));
        assert_eq!(store.offsets().load(&transcript).byte_offset, 0);
        assert_eq!(store.tool_buffer().load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_reset_buffer_only() {
        let (_dir, store, transcript) = seeded();
        reset(&store, None, true).unwrap();
        assert!(store.tool_buffer().load_all().unwrap().is_empty());
        assert_eq!(store.offsets().load(&transcript).byte_offset, 42);
        assert!(store.backend().load("http://localhost:3000").is_some());
    }

    #[test]
    fn test_reset_everything() {
        let (_dir, store, transcript) = seeded();
        reset(&store, None, false).unwrap();
        assert!(store.tool_buffer().load_all().unwrap().is_empty());
        assert_eq!(store.offsets().load(&transcript).byte_offset, 0);
        assert!(!store.paths().offsets.exists());
        assert!(store.backend().load("http://localhost:3000").is_none());
    }
}
