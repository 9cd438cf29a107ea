//! Status command - show stored offsets and buffered tool events

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::json;

use cctrace_core::ToolPhase;
use cctrace_state::{transcript_len, OffsetRecord, StateStore};

use crate::cli::{Cli, OutputFormat};
use crate::output::{self, colors};

/// Buffered events for one session
#[derive(Debug, Default, PartialEq, Eq)]
struct BufferedSession {
    before: usize,
    after: usize,
    tools: BTreeMap<String, usize>,
}

fn buffered_by_session(store: &StateStore) -> Result<BTreeMap<String, BufferedSession>> {
    let mut sessions: BTreeMap<String, BufferedSession> = BTreeMap::new();
    for event in store.tool_buffer().load_all()? {
        let entry = sessions.entry(event.session_id.clone()).or_default();
        match event.phase {
            ToolPhase::Before => entry.before += 1,
            ToolPhase::After => entry.after += 1,
        }
        *entry.tools.entry(event.tool_name.clone()).or_insert(0) += 1;
    }
    Ok(sessions)
}

fn selected(store: &StateStore, transcript: Option<&Path>) -> Vec<OffsetRecord> {
    let records = store.offsets().all();
    match transcript {
        Some(path) => {
            let key = path.to_string_lossy();
            records.into_iter().filter(|r| r.file_path == key).collect()
        }
        None => records,
    }
}

pub fn run(cli: &Cli, transcript: Option<&PathBuf>) -> Result<()> {
    let store = StateStore::open(&cli.settings.state_dir()?)?;
    let records = selected(&store, transcript.map(|p| p.as_path()));
    let buffered = buffered_by_session(&store)?;
    let backend = store.backend().load(cli.settings.base_url.trim());

    if cli.effective_format() == OutputFormat::Json {
        let output = json!({
            "state_dir": store.paths().dir,
            "transcripts": records.iter().map(|r| {
                let len = transcript_len(Path::new(&r.file_path)).ok().flatten();
                json!({
                    "file_path": r.file_path,
                    "byte_offset": r.byte_offset,
                    "file_size": len,
                    "pending_bytes": len.map(|l| l.saturating_sub(r.byte_offset)),
                    "turn_count": r.turn_count,
                    "open_turn": r.open_turn.as_ref().map(|o| json!({
                        "byte_offset": o.byte_offset,
                        "turn_number": o.turn_number,
                        "turn_id": o.turn_id,
                        "shape": o.shape,
                    })),
                    "last_session_id": r.last_session_id,
                    "updated_at": r.updated_at,
                })
            }).collect::<Vec<_>>(),
            "backend": backend,
            "tool_buffer": buffered.iter().map(|(session, b)| json!({
                "session_id": session,
                "before": b.before,
                "after": b.after,
                "tools": b.tools,
            })).collect::<Vec<_>>(),
        });
        return output::print_json(cli, &output);
    }

    println!("{}", colors::header("Langfuse Trace Status"));
    println!();
    println!(
        "{} {}",
        colors::label("State dir:"),
        colors::value(&store.paths().dir.display().to_string())
    );
    match &backend {
        Some(b) => println!(
            "{} {} ({}, detected {})",
            colors::label("Backend:"),
            b.shape,
            b.version.as_deref().unwrap_or("unknown version"),
            colors::format_date(&b.probed_at)
        ),
        None => println!("{} not detected yet", colors::label("Backend:")),
    }
    println!();

    if records.is_empty() {
        println!("{}", colors::warning("No transcripts tracked yet"));
    }
    for r in &records {
        println!("{}", colors::value(&r.file_path));
        let len = transcript_len(Path::new(&r.file_path)).ok().flatten();
        match len {
            Some(len) if len > r.byte_offset => println!(
                "  {} {} of {} ({} pending)",
                colors::label("Offset:"),
                colors::format_size(r.byte_offset),
                colors::format_size(len),
                colors::format_size(len - r.byte_offset)
            ),
            Some(len) if len < r.byte_offset => println!(
                "  {} {}",
                colors::label("Offset:"),
                colors::warning(&format!(
                    "{} stored but file is {} (restarts from 0)",
                    colors::format_size(r.byte_offset),
                    colors::format_size(len)
                ))
            ),
            Some(_) => println!(
                "  {} {} (up to date)",
                colors::label("Offset:"),
                colors::format_size(r.byte_offset)
            ),
            None => println!(
                "  {} {} (file missing)",
                colors::label("Offset:"),
                colors::format_size(r.byte_offset)
            ),
        }
        println!("  {} {}", colors::label("Turns:"), r.turn_count);
        if let Some(open) = &r.open_turn {
            println!(
                "  {} turn {} is partial and will be re-sent",
                colors::label("Open:"),
                open.turn_number
            );
        }
        if let Some(session) = &r.last_session_id {
            println!("  {} {}", colors::label("Session:"), session);
        }
        if let Some(ts) = &r.updated_at {
            println!("  {} {}", colors::label("Updated:"), colors::format_date(ts));
        }
    }

    println!();
    println!("{}", colors::header("Tool Buffer"));
    if buffered.is_empty() {
        println!("  empty");
    }
    for (session, b) in &buffered {
        println!(
            "  {}  {} {}  {} {}",
            session,
            b.before,
            colors::colored_phase("before"),
            b.after,
            colors::colored_phase("after")
        );
        for (tool, count) in &b.tools {
            println!("    {:<24} {}", colors::colored_tool(tool), count);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cctrace_core::ToolEvent;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_buffered_grouped_by_session() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let lock = store.lock().unwrap();
        let buffer = store.tool_buffer();
        buffer.append(&lock, &ToolEvent::new("e1", "s1", "Bash", ToolPhase::Before, Utc::now())).unwrap();
        buffer.append(&lock, &ToolEvent::new("e2", "s1", "Bash", ToolPhase::After, Utc::now())).unwrap();
        buffer.append(&lock, &ToolEvent::new("e3", "s2", "Read", ToolPhase::Before, Utc::now())).unwrap();

        let grouped = buffered_by_session(&store).unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["s1"].before, 1);
        assert_eq!(grouped["s1"].after, 1);
        assert_eq!(grouped["s1"].tools["Bash"], 2);
        assert_eq!(grouped["s2"].tools["Read"], 1);
    }

    #[test]
    fn test_filter_by_transcript() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let lock = store.lock().unwrap();
        let a = dir.path().join("a.jsonl");
        let b = dir.path().join("b.jsonl");
        for path in [&a, &b] {
            let mut record = OffsetRecord::new(path);
            record.byte_offset = 10;
            store.offsets().commit(&lock, &record, 0).unwrap();
        }
        assert_eq!(selected(&store, None).len(), 2);
        let only_a = selected(&store, Some(&a));
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].file_path, a.to_string_lossy());
    }
}
