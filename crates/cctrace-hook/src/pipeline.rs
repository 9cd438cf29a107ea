//! One hook invocation, start to finish
//!
//! A run reads the payload, then either buffers a tool event or reads the
//! transcript past its stored offset, assembles turns, correlates buffered
//! tool events and sends everything in one flush. The offset and the tool
//! buffer are only updated after the flush; any retryable error before that
//! leaves state untouched so the next run retries the same data. Events the
//! backend refuses for good are dropped and the run commits past them.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use cctrace_core::{
    pair_tool_events, Correlator, HookEventKind, ToolEvent, ToolInvocation, Turn, TurnBuilder,
};
use cctrace_langfuse::{
    build_notification_trace, build_standalone_tool_trace, build_turn_trace, detect, select_sink,
    BackendCapabilities, TraceEmitter, TraceOptions, TraceShape, Transport, TransportError,
    TurnTrace,
};
use cctrace_state::{
    read_new, transcript_len, BackendRecord, CommitOutcome, OffsetRecord, OpenTurn, ReadOutcome,
    StateError, StateStore,
};

use crate::config::{ConfigError, HookConfig};
use crate::payload::HookPayload;

/// Everything that can end a run early. None of it reaches the caller.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed hook payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Tool call {tool_name} never matched a turn (events: {event_ids})")]
    CorrelationMiss { tool_name: String, event_ids: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

impl PipelineError {
    fn correlation_miss(invocation: &ToolInvocation) -> Self {
        PipelineError::CorrelationMiss {
            tool_name: invocation.tool_name.clone(),
            event_ids: invocation.event_ids.join(","),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NoSession,
    NoTranscript,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "tracing disabled"),
            SkipReason::NoSession => write!(f, "payload has no session id"),
            SkipReason::NoTranscript => write!(f, "payload has no transcript path"),
        }
    }
}

/// What a successful run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub event: Option<HookEventKind>,
    pub turns: usize,
    pub traces: usize,
    pub events_sent: usize,
    pub events_dropped: usize,
    pub tool_events_buffered: usize,
    pub tool_events_consumed: usize,
    pub malformed_lines: usize,
    pub offset: Option<u64>,
    pub shape: Option<TraceShape>,
}

/// Result of a run. The entry point maps all of them to a clean exit.
#[derive(Debug)]
pub enum RunOutcome {
    Ok(RunSummary),
    Skipped(SkipReason),
    Recovered(PipelineError),
}

/// Per-run context, built fresh for every invocation
pub struct RunContext<'a> {
    pub config: HookConfig,
    pub store: StateStore,
    pub transport: &'a dyn Transport,
    pub now: DateTime<Utc>,
}

impl<'a> RunContext<'a> {
    pub fn new(config: HookConfig, transport: &'a dyn Transport) -> Result<Self, PipelineError> {
        let store = StateStore::open(&config.state_dir)?;
        Ok(Self {
            config,
            store,
            transport,
            now: Utc::now(),
        })
    }

    fn trace_options(
        &self,
        kind: HookEventKind,
        payload: &HookPayload,
        transcript: Option<&Path>,
    ) -> TraceOptions {
        TraceOptions {
            max_chars: self.config.max_chars,
            user_id: self.config.user_id.clone(),
            hostname: self.config.hostname.clone(),
            hook_event: kind,
            transcript_path: transcript
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            cwd: payload.cwd.clone(),
            permission_mode: payload.permission_mode.clone(),
            now: self.now,
        }
    }

    /// Shape for this run, and a newly detected backend record to remember.
    ///
    /// A forced setting wins, then the shape a reopened turn was first sent
    /// in, then the remembered backend. Only with none of those is the
    /// backend probed.
    fn capabilities(&self, reopened: Option<TraceShape>) -> (BackendCapabilities, Option<BackendRecord>) {
        if let Some(shape) = self.config.shape.forced() {
            return (BackendCapabilities::for_shape(shape), None);
        }
        if let Some(shape) = reopened {
            debug!(%shape, "Keeping the shape the open turn was sent in");
            return (BackendCapabilities::for_shape(shape), None);
        }
        if let Some(record) = self.store.backend().load(&self.config.base_url) {
            let caps = BackendCapabilities {
                version: record.version,
                ..BackendCapabilities::for_shape(record.shape)
            };
            return (caps, None);
        }
        match detect(self.transport) {
            Ok(caps) => {
                let record = BackendRecord {
                    base_url: self.config.base_url.clone(),
                    shape: caps.shape,
                    version: caps.version.clone(),
                    probed_at: self.now,
                };
                (caps, Some(record))
            }
            Err(e) => {
                warn!(error = %e, "Capability probe failed, using flat traces");
                (BackendCapabilities::for_shape(TraceShape::Flat), None)
            }
        }
    }
}

/// Run the pipeline on one raw payload
pub fn run(ctx: &RunContext, input: &str) -> RunOutcome {
    match process(ctx, input) {
        Ok(outcome) => outcome,
        Err(e) => RunOutcome::Recovered(e),
    }
}

/// New turns read from a transcript, and the offset record to commit once
/// they are sent
struct TranscriptProgress {
    turns: Vec<Turn>,
    /// Number of the turn before `turns[0]`
    base: u64,
    stored: OffsetRecord,
    next: OffsetRecord,
    malformed: usize,
    /// Shape of the open turn re-read in this run
    reopened: Option<TraceShape>,
}

impl TranscriptProgress {
    fn needs_commit(&self) -> bool {
        self.next.byte_offset != self.stored.byte_offset
            || self.next.turn_count != self.stored.turn_count
            || self.next.open_turn != self.stored.open_turn
    }
}

fn read_transcript(
    ctx: &RunContext,
    path: &Path,
    session_id: &str,
) -> Result<Option<TranscriptProgress>, PipelineError> {
    let stored = ctx.store.offsets().load(path);
    let len = match transcript_len(path)? {
        Some(len) => len,
        None => {
            debug!(path = %path.display(), "Transcript does not exist yet");
            return Ok(None);
        }
    };

    let mut next = stored.clone();
    next.last_session_id = Some(session_id.to_string());

    if len == stored.byte_offset {
        debug!(path = %path.display(), offset = len, "No new transcript data");
        return Ok(Some(TranscriptProgress {
            turns: Vec::new(),
            base: stored.turn_count,
            stored,
            next,
            malformed: 0,
            reopened: None,
        }));
    }

    let mut reopened = None;
    let (from, mut base) = if len < stored.byte_offset {
        warn!(
            path = %path.display(),
            stored = stored.byte_offset,
            len,
            "Transcript shrank, restarting from the beginning"
        );
        (0, 0)
    } else {
        match &stored.open_turn {
            // Reopen the partial turn so it is re-sent with what followed it
            Some(open) => {
                reopened = open.shape;
                (open.byte_offset, open.turn_number.saturating_sub(1))
            }
            None => (stored.byte_offset, stored.turn_count),
        }
    };

    let (mut turns, mut end, malformed) = match read_new(path, from)? {
        ReadOutcome::Missing => return Ok(None),
        ReadOutcome::NoNewData { offset } => (Vec::new(), offset, 0),
        ReadOutcome::Records(mut records) => {
            let mut builder = TurnBuilder::new(session_id);
            for record in records.by_ref() {
                builder.push(record);
            }
            if builder.orphans() > 0 {
                warn!(
                    path = %path.display(),
                    orphans = builder.orphans(),
                    "Records with no user prompt before them were not traced"
                );
            }
            let turns = builder.finish();
            if records.restarted() {
                base = 0;
            }
            (turns, records.offset(), records.skipped())
        }
    };

    // Only an incomplete line past the old offset: nothing new to send
    if end <= stored.byte_offset && len >= stored.byte_offset {
        turns.clear();
        base = stored.turn_count;
        end = stored.byte_offset;
        reopened = None;
    } else {
        next.turn_count = base + turns.len() as u64;
        next.open_turn = turns.last().filter(|t| t.is_partial()).map(|t| OpenTurn {
            byte_offset: t.user_offset,
            turn_number: next.turn_count,
            turn_id: t.turn_id.clone(),
            shape: None,
        });
    }
    next.byte_offset = end;

    debug!(
        path = %path.display(),
        from,
        to = end,
        turns = turns.len(),
        malformed,
        "Read transcript"
    );
    Ok(Some(TranscriptProgress {
        turns,
        base,
        stored,
        next,
        malformed,
        reopened,
    }))
}

fn process(ctx: &RunContext, input: &str) -> Result<RunOutcome, PipelineError> {
    let payload = HookPayload::parse(input)?;
    let kind = payload.event_kind();
    let Some(session_id) = payload.session_id() else {
        return Ok(RunOutcome::Skipped(SkipReason::NoSession));
    };
    debug!(event = %kind, session = %session_id, "Hook invoked");

    if let Some(event) = payload.tool_event(kind, &session_id, ctx.now) {
        let lock = ctx.store.lock()?;
        let buffer = ctx.store.tool_buffer();
        buffer.append(&lock, &event)?;
        info!(event = %kind, tool = %event.tool_name, id = %event.id, "Buffered tool event");
        let limit = ctx.config.retention.buffer_limit();
        let trimmed = buffer.trim_oldest(&lock, limit)?;
        if trimmed > 0 {
            warn!(trimmed, limit, "Tool buffer full, dropped the oldest events");
        }
        return Ok(RunOutcome::Ok(RunSummary {
            event: Some(kind),
            tool_events_buffered: 1,
            ..Default::default()
        }));
    }

    let transcript = payload.transcript_path();
    if transcript.is_none() && kind != HookEventKind::Notification {
        return Ok(RunOutcome::Skipped(SkipReason::NoTranscript));
    }

    let mut progress = match &transcript {
        Some(path) => read_transcript(ctx, path, &session_id)?,
        None => None,
    };
    let opts = ctx.trace_options(kind, &payload, transcript.as_deref());

    let buffer = ctx.store.tool_buffer();
    let (events, foreign): (Vec<ToolEvent>, Vec<ToolEvent>) = buffer
        .load_all()?
        .into_iter()
        .partition(|e| e.session_id == session_id);
    let mut correlator = Correlator::new(&events);
    let mut consumed: HashSet<String> = HashSet::new();
    let mut traces: Vec<TurnTrace> = Vec::new();

    if let Some(progress) = &progress {
        for (i, turn) in progress.turns.iter().enumerate() {
            let matches = correlator.match_turn(turn);
            for m in &matches {
                consumed.extend(m.invocation.event_ids.iter().cloned());
            }
            traces.push(build_turn_trace(turn, progress.base + i as u64 + 1, &matches, &opts));
        }
    }

    // Retention covers every session, including ones that never stop again
    let mut unmatched = correlator.finish().unmatched;
    unmatched.extend(pair_tool_events(&foreign));
    let (kept, stale) = ctx.config.retention.split_stale(unmatched, ctx.now);
    let foreign_opts = TraceOptions {
        transcript_path: String::new(),
        cwd: None,
        permission_mode: None,
        ..opts.clone()
    };
    for mut invocation in stale {
        warn!(error = %PipelineError::correlation_miss(&invocation), "Sending stale tool call on its own");
        consumed.extend(invocation.event_ids.iter().cloned());
        invocation.mark_emitted();
        let trace_opts = if invocation.session_id == session_id { &opts } else { &foreign_opts };
        traces.push(build_standalone_tool_trace(&invocation, trace_opts));
    }
    if !kept.is_empty() {
        debug!(pending = kept.len(), "Tool calls left buffered for a later turn");
    }

    if kind == HookEventKind::Notification {
        traces.push(build_notification_trace(&session_id, &payload.notification(), &opts));
    }

    let mut summary = RunSummary {
        event: Some(kind),
        turns: progress.as_ref().map_or(0, |p| p.turns.len()),
        malformed_lines: progress.as_ref().map_or(0, |p| p.malformed),
        ..Default::default()
    };

    let mut detected = None;
    if !traces.is_empty() {
        let (caps, record) = ctx.capabilities(progress.as_ref().and_then(|p| p.reopened));
        detected = record;
        let mut emitter = TraceEmitter::new(select_sink(&caps), ctx.transport);
        for trace in &traces {
            emitter.queue(trace);
        }
        let report = emitter.flush()?;
        if report.dropped > 0 {
            warn!(dropped = report.dropped, "Backend refused some events for good, committing past them");
        }
        summary.traces = report.traces;
        summary.events_sent = report.events;
        summary.events_dropped = report.dropped;
        summary.shape = Some(caps.shape);

        // Only a turn emitted in this run takes this run's shape
        let emitted = progress.as_mut().filter(|p| !p.turns.is_empty());
        if let Some(open) = emitted.and_then(|p| p.next.open_turn.as_mut()) {
            open.shape = Some(caps.shape);
        }
    }

    let commit_offset = progress.as_ref().filter(|p| p.needs_commit());
    if commit_offset.is_some() || !consumed.is_empty() || detected.is_some() {
        let lock = ctx.store.lock()?;
        if let Some(record) = &detected {
            ctx.store.backend().save(&lock, record)?;
        }
        if let Some(p) = commit_offset {
            match ctx.store.offsets().commit(&lock, &p.next, p.stored.byte_offset)? {
                CommitOutcome::Written => summary.offset = Some(p.next.byte_offset),
                CommitOutcome::Superseded => {
                    info!(file = %p.next.file_path, "Offset advanced by a concurrent run, keeping theirs")
                }
            }
        }
        if !consumed.is_empty() {
            summary.tool_events_consumed = buffer.remove(&lock, &consumed)?;
        }
    }

    Ok(RunOutcome::Ok(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cctrace_core::RetentionPolicy;
    use cctrace_langfuse::{
        EventBody, EventKind, HealthStatus, IngestionBatch, IngestionResponse, RecordingTransport,
        ShapePreference,
    };
    use serde_json::{json, Value};
    use std::cell::Cell;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FailingTransport;

    /// Records every batch, then reports one event of it as invalid
    struct RefusingTransport {
        inner: RecordingTransport,
    }

    impl Transport for RefusingTransport {
        fn health(&self) -> Result<HealthStatus, TransportError> {
            self.inner.health()
        }

        fn ingest(&self, batch: &IngestionBatch) -> Result<IngestionResponse, TransportError> {
            self.inner.ingest(batch)?;
            Err(TransportError::Partial {
                failed: 1,
                first: "event e1 (400): invalid body".into(),
                retryable: false,
            })
        }
    }

    /// Health endpoint down, ingestion fine
    struct HealthDownTransport {
        inner: RecordingTransport,
        health_calls: Cell<usize>,
    }

    impl HealthDownTransport {
        fn new() -> Self {
            Self {
                inner: RecordingTransport::new(None),
                health_calls: Cell::new(0),
            }
        }
    }

    impl Transport for HealthDownTransport {
        fn health(&self) -> Result<HealthStatus, TransportError> {
            self.health_calls.set(self.health_calls.get() + 1);
            Err(TransportError::Unavailable("connection reset".into()))
        }

        fn ingest(&self, batch: &IngestionBatch) -> Result<IngestionResponse, TransportError> {
            self.inner.ingest(batch)
        }
    }

    impl Transport for FailingTransport {
        fn health(&self) -> Result<HealthStatus, TransportError> {
            Err(TransportError::Unavailable("connection refused".into()))
        }

        fn ingest(&self, _batch: &IngestionBatch) -> Result<IngestionResponse, TransportError> {
            Err(TransportError::Unavailable("connection refused".into()))
        }
    }

    fn config(dir: &Path) -> HookConfig {
        HookConfig {
            public_key: "pk".into(),
            secret_key: "sk".into(),
            base_url: "http://localhost:3000".into(),
            user_id: "claude-user".into(),
            hostname: "devbox".into(),
            max_chars: 20_000,
            timeout: Duration::from_secs(1),
            retention: RetentionPolicy::default(),
            shape: ShapePreference::Nested,
            state_dir: dir.join("state"),
            dry_run: false,
        }
    }

    fn write_lines(path: &Path, lines: &[Value]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
    }

    fn stop_payload(transcript: &Path) -> String {
        json!({
            "hook_event_name": "Stop",
            "session_id": "s1",
            "transcript_path": transcript,
            "cwd": "/work"
        })
        .to_string()
    }

    fn run_once(cfg: HookConfig, transport: &dyn Transport, input: &str) -> RunOutcome {
        let ctx = RunContext::new(cfg, transport).unwrap();
        run(&ctx, input)
    }

    fn summary(outcome: RunOutcome) -> RunSummary {
        match outcome {
            RunOutcome::Ok(s) => s,
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    fn user(uuid: &str, ts: &str, text: &str) -> Value {
        json!({"type": "user", "uuid": uuid, "sessionId": "s1", "timestamp": ts,
               "message": {"role": "user", "content": text}})
    }

    fn assistant(id: &str, ts: &str, stop: Option<&str>, content: Value) -> Value {
        json!({"type": "assistant", "sessionId": "s1", "timestamp": ts,
               "message": {"id": id, "role": "assistant", "model": "claude-sonnet",
                           "stop_reason": stop,
                           "usage": {"input_tokens": 10, "output_tokens": 5},
                           "content": content}})
    }

    fn ordered_turn() -> Vec<Value> {
        vec![
            user("u1", "2024-01-01T00:00:00Z", "list files"),
            assistant("m1", "2024-01-01T00:00:01Z", Some("tool_use"), json!([
                {"type": "thinking", "thinking": "use ls"},
                {"type": "text", "text": "Listing."},
                {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "ls"}}
            ])),
            json!({"type": "user", "uuid": "u2", "sessionId": "s1", "timestamp": "2024-01-01T00:00:02Z",
                   "message": {"role": "user", "content": [
                       {"type": "tool_result", "tool_use_id": "toolu_1", "content": "a.txt"}]}}),
            assistant("m2", "2024-01-01T00:00:03Z", Some("end_turn"), json!([
                {"type": "text", "text": "Done."}
            ])),
        ]
    }

    fn trace_names(batches: &[IngestionBatch]) -> Vec<String> {
        batches
            .iter()
            .flat_map(|b| b.batch.iter())
            .filter(|e| e.kind == EventKind::TraceCreate)
            .filter_map(|e| match &e.body {
                EventBody::Trace(t) => Some(t.name.clone()),
                _ => None,
            })
            .collect()
    }

    fn trace_ids(batches: &[IngestionBatch]) -> Vec<String> {
        batches
            .iter()
            .flat_map(|b| b.batch.iter())
            .filter(|e| e.kind == EventKind::TraceCreate)
            .map(|e| e.body_id().to_string())
            .collect()
    }

    fn setup() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("session.jsonl");
        (dir, transcript)
    }

    #[test]
    fn test_no_new_data_emits_nothing() {
        let (dir, transcript) = setup();
        write_lines(&transcript, &ordered_turn());
        let transport = RecordingTransport::new(None);

        let first = summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));
        assert_eq!(first.turns, 1);
        assert_eq!(first.offset, Some(std::fs::metadata(&transcript).unwrap().len()));

        let second = summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));
        assert_eq!(second.traces, 0);
        assert_eq!(transport.batches().len(), 1);
    }

    #[test]
    fn test_resume_after_state_loss_reproduces_turns() {
        let (dir, transcript) = setup();
        let mut lines = ordered_turn();
        lines.push(user("u3", "2024-01-01T00:01:00Z", "thanks"));
        lines.push(assistant("m3", "2024-01-01T00:01:01Z", Some("end_turn"), json!([{"type": "text", "text": "Welcome."}])));
        write_lines(&transcript, &lines);

        let transport = RecordingTransport::new(None);
        summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));
        let first = trace_ids(&transport.batches());

        std::fs::remove_dir_all(dir.path().join("state")).unwrap();
        let replay = RecordingTransport::new(None);
        summary(run_once(config(dir.path()), &replay, &stop_payload(&transcript)));

        assert_eq!(first.len(), 2);
        assert_eq!(first, trace_ids(&replay.batches()));
        assert_eq!(
            trace_names(&replay.batches()),
            vec!["Claude Code - Turn 1", "Claude Code - Turn 2"]
        );
    }

    #[test]
    fn test_spans_follow_transcript_order() {
        let (dir, transcript) = setup();
        write_lines(&transcript, &ordered_turn());
        let transport = RecordingTransport::new(None);
        summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));

        let batch = &transport.batches()[0];
        let names: Vec<&str> = batch
            .batch
            .iter()
            .filter_map(|e| match &e.body {
                EventBody::Observation(o) if o.parent_observation_id.is_some() => Some(o.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            names,
            vec!["Claude Response", "Thinking [1]", "Text [1]", "Tool: Bash", "Text [2]"]
        );
    }

    #[test]
    fn test_user_only_transcript_yields_partial_turn() {
        let (dir, transcript) = setup();
        write_lines(&transcript, &[user("u1", "2024-01-01T00:00:00Z", "hello?")]);
        let transport = RecordingTransport::new(None);

        let s = summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));
        assert_eq!(s.turns, 1);
        assert_eq!(trace_names(&transport.batches()), vec!["Claude Code - Turn 1 (partial)"]);

        let ctx = RunContext::new(config(dir.path()), &transport).unwrap();
        let record = ctx.store.offsets().load(&transcript);
        let open = record.open_turn.unwrap();
        assert_eq!(open.byte_offset, 0);
        assert_eq!(open.turn_number, 1);
    }

    #[test]
    fn test_partial_turn_reopened_with_same_id() {
        let (dir, transcript) = setup();
        write_lines(&transcript, &[user("u1", "2024-01-01T00:00:00Z", "hello?")]);
        let transport = RecordingTransport::new(None);
        summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));

        write_lines(&transcript, &[assistant("m1", "2024-01-01T00:00:05Z", Some("end_turn"),
                                             json!([{"type": "text", "text": "Hi."}]))]);
        summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));

        let ids = trace_ids(&transport.batches());
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
        assert_eq!(
            trace_names(&transport.batches()),
            vec!["Claude Code - Turn 1 (partial)", "Claude Code - Turn 1"]
        );

        let ctx = RunContext::new(config(dir.path()), &transport).unwrap();
        let record = ctx.store.offsets().load(&transcript);
        assert!(record.open_turn.is_none());
        assert_eq!(record.turn_count, 1);
    }

    #[test]
    fn test_before_and_after_events_become_one_tool_span() {
        let (dir, transcript) = setup();
        write_lines(&transcript, &ordered_turn());
        let transport = RecordingTransport::new(None);

        let pre = json!({"hook_event_name": "PreToolUse", "session_id": "s1",
                         "tool_name": "Bash", "tool_input": {"command": "ls"}});
        let post = json!({"hook_event_name": "PostToolUse", "session_id": "s1",
                          "tool_name": "Bash", "tool_input": {"command": "ls"},
                          "tool_response": {"stdout": "a.txt"}});
        let s = summary(run_once(config(dir.path()), &transport, &pre.to_string()));
        assert_eq!(s.tool_events_buffered, 1);
        summary(run_once(config(dir.path()), &transport, &post.to_string()));
        assert!(transport.batches().is_empty());

        let s = summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));
        assert_eq!(s.tool_events_consumed, 2);

        let tools: Vec<_> = transport.batches()[0]
            .batch
            .iter()
            .filter_map(|e| match &e.body {
                EventBody::Observation(o) if o.name.contains("Bash") => Some(o.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].input, Some(json!({"command": "ls"})));
        assert!(tools[0].output.is_some());
        assert!(tools[0].metadata.as_ref().unwrap().get("hook").is_some());

        let ctx = RunContext::new(config(dir.path()), &transport).unwrap();
        assert!(ctx.store.tool_buffer().load_all().unwrap().is_empty());
    }

    #[test]
    fn test_transport_failure_leaves_offset_unchanged() {
        let (dir, transcript) = setup();
        write_lines(&transcript, &ordered_turn());

        let outcome = run_once(config(dir.path()), &FailingTransport, &stop_payload(&transcript));
        assert!(matches!(outcome, RunOutcome::Recovered(PipelineError::Transport(_))));

        let transport = RecordingTransport::new(None);
        let ctx = RunContext::new(config(dir.path()), &transport).unwrap();
        assert_eq!(ctx.store.offsets().load(&transcript).byte_offset, 0);

        // The next run retries the same turn
        let s = summary(run(&ctx, &stop_payload(&transcript)));
        assert_eq!(s.turns, 1);
        assert_eq!(s.traces, 1);
    }

    #[test]
    fn test_long_text_truncated_to_limit() {
        let (dir, transcript) = setup();
        write_lines(&transcript, &[
            user("u1", "2024-01-01T00:00:00Z", "go"),
            assistant("m1", "2024-01-01T00:00:01Z", Some("end_turn"),
                      json!([{"type": "text", "text": "y".repeat(5000)}])),
        ]);
        let mut cfg = config(dir.path());
        cfg.max_chars = 300;
        let transport = RecordingTransport::new(None);
        summary(run_once(cfg, &transport, &stop_payload(&transcript)));

        let text = transport.batches()[0]
            .batch
            .iter()
            .find_map(|e| match &e.body {
                EventBody::Observation(o) if o.name == "Text [1]" => o.output.clone(),
                _ => None,
            })
            .unwrap();
        let text = text.as_str().unwrap();
        assert_eq!(text.chars().count(), 300);
        assert!(text.contains("[truncated"));
    }

    #[test]
    fn test_missing_session_is_skipped() {
        let (dir, _transcript) = setup();
        let transport = RecordingTransport::new(None);
        let outcome = run_once(config(dir.path()), &transport, r#"{"hook_event_name":"Stop"}"#);
        assert!(matches!(outcome, RunOutcome::Skipped(SkipReason::NoSession)));
    }

    #[test]
    fn test_malformed_payload_recovered() {
        let (dir, _transcript) = setup();
        let transport = RecordingTransport::new(None);
        let outcome = run_once(config(dir.path()), &transport, "{not json");
        assert!(matches!(outcome, RunOutcome::Recovered(PipelineError::Parse(_))));
    }

    #[test]
    fn test_notification_trace() {
        let (dir, _transcript) = setup();
        let transport = RecordingTransport::new(None);
        let payload = json!({"hook_event_name": "Notification", "session_id": "s1",
                             "notification_type": "idle", "message": "Claude is waiting"});
        let s = summary(run_once(config(dir.path()), &transport, &payload.to_string()));
        assert_eq!(s.traces, 1);
        assert_eq!(trace_names(&transport.batches()), vec!["Claude Code - Notification"]);
    }

    #[test]
    fn test_stale_tool_event_sent_standalone() {
        let (dir, transcript) = setup();
        let transport = RecordingTransport::new(None);
        let pre = json!({"hook_event_name": "PreToolUse", "session_id": "s1",
                         "tool_name": "Read", "tool_input": {"file_path": "/x"}});
        summary(run_once(config(dir.path()), &transport, &pre.to_string()));

        write_lines(&transcript, &[user("u1", "2024-01-01T00:00:00Z", "hi"),
                                   assistant("m1", "2024-01-01T00:00:01Z", Some("end_turn"),
                                             json!([{"type": "text", "text": "Hello."}]))]);
        let mut ctx = RunContext::new(config(dir.path()), &transport).unwrap();
        ctx.now += chrono::Duration::hours(2);
        let s = summary(run(&ctx, &stop_payload(&transcript)));

        assert_eq!(s.tool_events_consumed, 1);
        assert_eq!(
            trace_names(&transport.batches()),
            vec!["Claude Code - Turn 1", "Claude Code - Tool: Read"]
        );
        assert!(ctx.store.tool_buffer().load_all().unwrap().is_empty());
    }

    #[test]
    fn test_turn_numbers_continue_across_runs() {
        let (dir, transcript) = setup();
        write_lines(&transcript, &ordered_turn());
        let transport = RecordingTransport::new(None);
        summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));

        write_lines(&transcript, &[user("u9", "2024-01-01T00:02:00Z", "again"),
                                   assistant("m9", "2024-01-01T00:02:01Z", Some("end_turn"),
                                             json!([{"type": "text", "text": "Sure."}]))]);
        summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));
        assert_eq!(
            trace_names(&transport.batches()),
            vec!["Claude Code - Turn 1", "Claude Code - Turn 2"]
        );
    }

    fn pre_tool(session: &str, n: usize) -> String {
        json!({"hook_event_name": "PreToolUse", "session_id": session,
               "tool_name": "Bash", "tool_input": {"n": n}})
        .to_string()
    }

    fn closed_turn(uuid: &str, id: &str) -> Vec<Value> {
        vec![
            user(uuid, "2024-01-01T00:00:00Z", "hi"),
            assistant(id, "2024-01-01T00:00:01Z", Some("end_turn"), json!([{"type": "text", "text": "Hello."}])),
        ]
    }

    #[test]
    fn test_abandoned_session_events_pruned() {
        let (dir, transcript) = setup();
        let mut cfg = config(dir.path());
        cfg.retention = RetentionPolicy {
            max_age: chrono::Duration::seconds(60),
            max_events: 2,
        };
        let transport = RecordingTransport::new(None);
        for n in 0..10 {
            summary(run_once(cfg.clone(), &transport, &pre_tool("abandoned", n)));
        }
        let ctx = RunContext::new(cfg.clone(), &transport).unwrap();
        assert_eq!(ctx.store.tool_buffer().load_all().unwrap().len(), 4);

        write_lines(&transcript, &closed_turn("u1", "m1"));
        let mut ctx = RunContext::new(cfg, &transport).unwrap();
        ctx.now += chrono::Duration::days(30);
        let s = summary(run(&ctx, &stop_payload(&transcript)));

        assert_eq!(s.tool_events_consumed, 4);
        assert!(ctx.store.tool_buffer().load_all().unwrap().is_empty());
        let standalone: Vec<String> = transport.batches()[0]
            .batch
            .iter()
            .filter(|e| e.kind == EventKind::TraceCreate)
            .filter_map(|e| match &e.body {
                EventBody::Trace(t) if t.name == "Claude Code - Tool: Bash" => Some(t.session_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(standalone, vec!["abandoned"; 4]);
    }

    #[test]
    fn test_fresh_events_of_other_sessions_stay_buffered() {
        let (dir, transcript) = setup();
        let transport = RecordingTransport::new(None);
        summary(run_once(config(dir.path()), &transport, &pre_tool("s2", 1)));

        write_lines(&transcript, &closed_turn("u1", "m1"));
        let s = summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));
        assert_eq!(s.tool_events_consumed, 0);

        let ctx = RunContext::new(config(dir.path()), &transport).unwrap();
        let left = ctx.store.tool_buffer().load_all().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].session_id, "s2");
    }

    #[test]
    fn test_permanently_refused_event_does_not_stall_transcript() {
        let (dir, transcript) = setup();
        write_lines(&transcript, &ordered_turn());
        let transport = RefusingTransport {
            inner: RecordingTransport::new(None),
        };

        let s = summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));
        assert_eq!(s.events_dropped, 1);
        assert_eq!(s.offset, Some(std::fs::metadata(&transcript).unwrap().len()));

        let s = summary(run_once(config(dir.path()), &transport, &stop_payload(&transcript)));
        assert_eq!(s.traces, 0);
        assert_eq!(transport.inner.batches().len(), 1);
    }

    #[test]
    fn test_server_error_keeps_offset() {
        struct Unavailable;
        impl Transport for Unavailable {
            fn health(&self) -> Result<HealthStatus, TransportError> {
                Ok(HealthStatus::default())
            }
            fn ingest(&self, _batch: &IngestionBatch) -> Result<IngestionResponse, TransportError> {
                Err(TransportError::Rejected {
                    status: 503,
                    body: "maintenance".into(),
                })
            }
        }

        let (dir, transcript) = setup();
        write_lines(&transcript, &ordered_turn());
        let outcome = run_once(config(dir.path()), &Unavailable, &stop_payload(&transcript));
        assert!(matches!(outcome, RunOutcome::Recovered(PipelineError::Transport(_))));

        let transport = RecordingTransport::new(None);
        let ctx = RunContext::new(config(dir.path()), &transport).unwrap();
        assert_eq!(ctx.store.offsets().load(&transcript).byte_offset, 0);
    }

    #[test]
    fn test_reopened_turn_keeps_its_shape_when_backend_unreachable() {
        let (dir, transcript) = setup();
        let mut cfg = config(dir.path());
        cfg.shape = ShapePreference::Auto;
        write_lines(&transcript, &[user("u1", "2024-01-01T00:00:00Z", "hello?")]);

        let modern = RecordingTransport::new(Some("3.2.0"));
        let s = summary(run_once(cfg.clone(), &modern, &stop_payload(&transcript)));
        assert_eq!(s.shape, Some(TraceShape::Nested));

        let ctx = RunContext::new(cfg.clone(), &modern).unwrap();
        let open = ctx.store.offsets().load(&transcript).open_turn.unwrap();
        assert_eq!(open.shape, Some(TraceShape::Nested));
        // Forget the backend so only the open turn remembers the shape
        std::fs::remove_file(&ctx.store.paths().backend).unwrap();

        write_lines(&transcript, &[assistant("m1", "2024-01-01T00:00:05Z", Some("end_turn"),
                                             json!([{"type": "text", "text": "Hi."}]))]);
        let flaky = HealthDownTransport::new();
        let s = summary(run_once(cfg.clone(), &flaky, &stop_payload(&transcript)));
        assert_eq!(s.shape, Some(TraceShape::Nested));
        assert_eq!(flaky.health_calls.get(), 0);
        assert_eq!(trace_ids(&modern.batches()), trace_ids(&flaky.inner.batches()));

        // A fresh turn with nothing remembered falls back to flat, and the
        // failed health check is not remembered
        write_lines(&transcript, &closed_turn("u2", "m2"));
        let s = summary(run_once(cfg, &flaky, &stop_payload(&transcript)));
        assert_eq!(s.shape, Some(TraceShape::Flat));
        assert_eq!(flaky.health_calls.get(), 1);
        assert!(!ctx.store.paths().backend.exists());
    }

    #[test]
    fn test_detected_shape_remembered_across_runs() {
        let (dir, transcript) = setup();
        let mut cfg = config(dir.path());
        cfg.shape = ShapePreference::Auto;
        write_lines(&transcript, &closed_turn("u1", "m1"));

        let modern = RecordingTransport::new(Some("3.2.0"));
        summary(run_once(cfg.clone(), &modern, &stop_payload(&transcript)));

        write_lines(&transcript, &closed_turn("u2", "m2"));
        let flaky = HealthDownTransport::new();
        let s = summary(run_once(cfg, &flaky, &stop_payload(&transcript)));
        assert_eq!(s.shape, Some(TraceShape::Nested));
        assert_eq!(flaky.health_calls.get(), 0);
    }
}
