//! Backend-neutral trace model
//!
//! A [`TurnTrace`] is what one turn (or one standalone tool call, or one
//! notification) becomes before a [`TraceSink`](crate::sink::TraceSink)
//! renders it into ingestion events. Observations are listed in content
//! order and their start times strictly increase, so the backend shows them
//! in the order they happened.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

use cctrace_core::{
    sha256_hex, truncate_text, truncate_value, ContentBlock, HookEventKind, TokenUsage,
    ToolInvocation, ToolResultEntry, Turn, TurnToolMatch,
};

pub const SOURCE: &str = "claude-code";
pub const HOOK_SOURCE: &str = "claude-code-hook";
pub const PARTIAL_TAG: &str = "partial";
pub const NOTIFICATION_TAG: &str = "notification";
pub const NO_TURN_CONTEXT_TAG: &str = "no-turn-context";

/// Per-run values stamped on every trace
#[derive(Debug, Clone)]
pub struct TraceOptions {
    pub max_chars: usize,
    pub user_id: String,
    pub hostname: String,
    pub hook_event: HookEventKind,
    pub transcript_path: String,
    pub cwd: Option<String>,
    pub permission_mode: Option<String>,
    /// Fallback time for records without timestamps
    pub now: DateTime<Utc>,
}

impl TraceOptions {
    fn tags(&self, extra: &[&str]) -> Vec<String> {
        let mut tags = vec![SOURCE.to_string()];
        if !self.hostname.is_empty() {
            tags.push(self.hostname.clone());
        }
        tags.extend(extra.iter().map(|t| t.to_string()));
        tags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationKind {
    Span,
    Generation,
    Tool,
    Event,
}

/// Token usage in backend terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSummary {
    pub input: u64,
    pub output: u64,
    pub input_cache_creation: u64,
    pub input_cache_read: u64,
    pub total: u64,
}

impl From<&TokenUsage> for UsageSummary {
    fn from(usage: &TokenUsage) -> Self {
        Self {
            input: usage.input_tokens,
            output: usage.output_tokens,
            input_cache_creation: usage.cache_creation_input_tokens.unwrap_or(0),
            input_cache_read: usage.cache_read_input_tokens.unwrap_or(0),
            total: usage.total(),
        }
    }
}

impl UsageSummary {
    pub fn details(&self) -> BTreeMap<String, u64> {
        let mut map = BTreeMap::new();
        map.insert("input".to_string(), self.input);
        map.insert("output".to_string(), self.output);
        map.insert("input_cache_creation".to_string(), self.input_cache_creation);
        map.insert("input_cache_read".to_string(), self.input_cache_read);
        map.insert("total".to_string(), self.total);
        map
    }
}

#[derive(Debug, Clone)]
pub struct Observation {
    /// Deterministic: trace id plus a per-trace suffix
    pub id: String,
    pub kind: ObservationKind,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub metadata: Value,
    pub model: Option<String>,
    pub usage: Option<UsageSummary>,
    pub level: Option<String>,
}

impl Observation {
    fn new(
        trace_id: &str,
        suffix: &str,
        kind: ObservationKind,
        name: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{}-{}", trace_id, suffix),
            kind,
            name: name.into(),
            start_time,
            end_time: None,
            input: None,
            output: None,
            metadata: Value::Null,
            model: None,
            usage: None,
            level: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnTrace {
    pub trace_id: String,
    pub name: String,
    pub session_id: String,
    pub user_id: String,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub metadata: Value,
    pub observations: Vec<Observation>,
}

impl TurnTrace {
    /// Latest start or end time of any observation
    pub fn end_time(&self) -> DateTime<Utc> {
        self.observations
            .iter()
            .map(|o| o.end_time.unwrap_or(o.start_time).max(o.start_time))
            .fold(self.timestamp, |a, b| a.max(b))
    }
}

/// Hands out strictly increasing timestamps
struct Clock {
    last: DateTime<Utc>,
}

impl Clock {
    fn new(start: DateTime<Utc>) -> Self {
        Self { last: start }
    }

    fn tick(&mut self, at: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let floor = self.last + Duration::milliseconds(1);
        let t = at.map_or(floor, |t| t.max(floor));
        self.last = t;
        t
    }
}

fn short_id(seed: &str) -> String {
    sha256_hex(seed)[..32].to_string()
}

#[allow(clippy::too_many_arguments)]
fn tool_observation(
    trace_id: &str,
    suffix: &str,
    start: DateTime<Utc>,
    tool_use_id: &str,
    name: &str,
    input: &Value,
    result: Option<&ToolResultEntry>,
    invocation: Option<&ToolInvocation>,
    max_chars: usize,
) -> Observation {
    let (input, input_meta) = truncate_value(input, max_chars);
    let raw_output = result
        .map(|r| r.content.clone())
        .or_else(|| invocation.and_then(|inv| inv.output.clone()));
    let (output, output_meta) = match raw_output {
        Some(v) => {
            let (v, meta) = truncate_value(&v, max_chars);
            (Some(v), meta)
        }
        None => (None, None),
    };
    let is_error = result.map_or(false, |r| r.is_error);

    let mut metadata = json!({
        "tool_name": name,
        "tool_id": tool_use_id,
        "input_meta": input_meta,
        "output_meta": output_meta,
        "is_error": is_error,
    });
    if let Some(inv) = invocation {
        metadata["hook"] = json!({
            "event_ids": inv.event_ids,
            "started_at": inv.started_at,
            "finished_at": inv.finished_at,
            "duration_ms": inv.duration_ms(),
        });
    }

    let mut obs = Observation::new(trace_id, suffix, ObservationKind::Tool, format!("Tool: {}", name), start);
    obs.input = Some(input);
    obs.output = output;
    obs.end_time = result
        .and_then(|r| r.timestamp)
        .or_else(|| invocation.and_then(|inv| inv.finished_at))
        .map(|end| end.max(start));
    obs.metadata = metadata;
    obs.level = is_error.then(|| "ERROR".to_string());
    obs
}

/// Render one turn.
///
/// `matches` are the buffered tool invocations the correlator tied to this
/// turn's `tool_use` blocks; they add hook timing to the tool observation
/// and supply its output when the transcript has none yet.
pub fn build_turn_trace(
    turn: &Turn,
    turn_number: u64,
    matches: &[TurnToolMatch],
    opts: &TraceOptions,
) -> TurnTrace {
    let trace_id = turn.turn_id.clone();
    let timestamp = turn.started_at().unwrap_or(opts.now);
    let mut clock = Clock::new(timestamp);
    let mut observations = Vec::new();

    let (user_text, user_meta) = truncate_text(&turn.user_text(), opts.max_chars);
    let user_input = json!({"role": "user", "content": user_text});

    if let Some(system) = &turn.system_prompt {
        let (text, meta) = truncate_text(system, opts.max_chars);
        let mut obs = Observation::new(&trace_id, "system", ObservationKind::Span, "System Prompt", clock.tick(None));
        obs.input = Some(json!({"role": "system"}));
        obs.output = Some(json!({"role": "system", "content": text}));
        obs.metadata = json!({"system_text": meta});
        observations.push(obs);
    }

    let usage = turn.usage.as_ref().map(UsageSummary::from);
    let output = if turn.is_user_only() {
        json!({"status": PARTIAL_TAG, "reason": "no assistant response"})
    } else {
        let (assistant_text, assistant_meta) = truncate_text(&turn.assistant_text(), opts.max_chars);
        let output = json!({"role": "assistant", "content": assistant_text});

        let start = clock.tick(turn.blocks.first().and_then(|b| b.timestamp));
        let mut gen = Observation::new(&trace_id, "generation", ObservationKind::Generation, "Claude Response", start);
        gen.model = turn.model.clone();
        gen.usage = usage.clone();
        gen.input = Some(user_input.clone());
        gen.output = Some(output.clone());
        gen.end_time = turn.ended_at.map(|end| end.max(start));
        gen.metadata = json!({
            "assistant_text": assistant_meta,
            "stop_reason": turn.stop_reason,
            "content_blocks": turn.blocks.len(),
        });
        observations.push(gen);
        output
    };

    let by_block: HashMap<usize, &ToolInvocation> = matches
        .iter()
        .map(|m| (m.block_index, &m.invocation))
        .collect();

    let (mut n_text, mut n_thinking, mut n_other) = (0, 0, 0);
    for (i, block) in turn.blocks.iter().enumerate() {
        let start = clock.tick(block.timestamp);
        let suffix = format!("b{}", i);
        let obs = match &block.block {
            ContentBlock::Text { text } => {
                n_text += 1;
                let (text, meta) = truncate_text(text, opts.max_chars);
                let mut obs = Observation::new(&trace_id, &suffix, ObservationKind::Span, format!("Text [{}]", n_text), start);
                obs.output = Some(Value::String(text));
                obs.metadata = json!({"type": "text", "text_meta": meta});
                obs
            }
            ContentBlock::Thinking { thinking, .. } => {
                n_thinking += 1;
                let (text, meta) = truncate_text(thinking, opts.max_chars);
                let mut obs = Observation::new(&trace_id, &suffix, ObservationKind::Span, format!("Thinking [{}]", n_thinking), start);
                obs.output = Some(Value::String(text));
                obs.metadata = json!({"type": "thinking", "text_meta": meta});
                obs
            }
            ContentBlock::ToolUse { id, name, input } => tool_observation(
                &trace_id,
                &suffix,
                start,
                id,
                name,
                input,
                turn.tool_results.get(id),
                by_block.get(&i).copied(),
                opts.max_chars,
            ),
            other => {
                n_other += 1;
                let mut obs = Observation::new(
                    &trace_id,
                    &suffix,
                    ObservationKind::Span,
                    format!("Block [{}]: {}", n_other, other.kind()),
                    start,
                );
                obs.metadata = json!({"type": other.kind()});
                obs
            }
        };
        observations.push(obs);
    }

    let mut metadata = json!({
        "source": SOURCE,
        "session_id": turn.session_id,
        "turn_number": turn_number,
        "transcript_path": opts.transcript_path,
        "cwd": opts.cwd,
        "hostname": opts.hostname,
        "hook_event": opts.hook_event.as_str(),
        "permission_mode": opts.permission_mode,
        "stop_reason": turn.stop_reason,
        "partial": turn.is_partial(),
        "model": turn.model,
        "has_system_prompt": turn.system_prompt.is_some(),
        "content_blocks": turn.blocks.len(),
        "text_blocks": turn.count_blocks("text"),
        "thinking_blocks": turn.count_blocks("thinking"),
        "tool_blocks": turn.count_blocks("tool_use"),
        "hook_tool_events": matches.len(),
        "user_text": user_meta,
    });
    if let Some(u) = &usage {
        metadata["usage"] = json!(u.details());
    }

    let (name, tags) = if turn.is_partial() {
        (
            format!("Claude Code - Turn {} (partial)", turn_number),
            opts.tags(&[PARTIAL_TAG]),
        )
    } else {
        (format!("Claude Code - Turn {}", turn_number), opts.tags(&[]))
    };

    TurnTrace {
        trace_id,
        name,
        session_id: turn.session_id.clone(),
        user_id: opts.user_id.clone(),
        tags,
        timestamp,
        input: Some(user_input),
        output: Some(output),
        metadata,
        observations,
    }
}

/// Trace for a buffered tool call that never matched a turn
pub fn build_standalone_tool_trace(invocation: &ToolInvocation, opts: &TraceOptions) -> TurnTrace {
    let anchor = invocation
        .event_ids
        .first()
        .cloned()
        .unwrap_or_else(|| invocation.key.clone());
    let trace_id = short_id(&format!("{}::tool::{}", invocation.session_id, anchor));

    let (input, input_meta) = truncate_value(&invocation.input, opts.max_chars);
    let (output, output_meta) = match &invocation.output {
        Some(v) => {
            let (v, meta) = truncate_value(v, opts.max_chars);
            (Some(v), meta)
        }
        None => (None, None),
    };

    let start = invocation.started_at;
    let mut obs = Observation::new(
        &trace_id,
        "tool",
        ObservationKind::Tool,
        format!("Hook Tool: {}", invocation.tool_name),
        start + Duration::milliseconds(1),
    );
    obs.input = Some(input.clone());
    obs.output = output.clone();
    obs.end_time = invocation.finished_at.map(|end| end.max(obs.start_time));
    obs.metadata = json!({
        "source": HOOK_SOURCE,
        "tool_name": invocation.tool_name,
        "tool_use_id": invocation.tool_use_id,
        "event_ids": invocation.event_ids,
        "state": invocation.state,
        "duration_ms": invocation.duration_ms(),
        "input_meta": input_meta,
        "output_meta": output_meta,
    });

    TurnTrace {
        trace_id,
        name: format!("Claude Code - Tool: {}", invocation.tool_name),
        session_id: invocation.session_id.clone(),
        user_id: opts.user_id.clone(),
        tags: opts.tags(&[NO_TURN_CONTEXT_TAG]),
        timestamp: start,
        input: Some(input),
        output,
        metadata: json!({
            "source": HOOK_SOURCE,
            "session_id": invocation.session_id,
            "hostname": opts.hostname,
            "hook_event": opts.hook_event.as_str(),
            "transcript_path": opts.transcript_path,
            "no_turn_context": true,
        }),
        observations: vec![obs],
    }
}

/// Fields of a Notification hook payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationInfo {
    pub notification_type: Option<String>,
    pub message: Option<String>,
    pub details: Option<Value>,
}

pub fn build_notification_trace(
    session_id: &str,
    info: &NotificationInfo,
    opts: &TraceOptions,
) -> TurnTrace {
    let trace_id = short_id(&format!(
        "{}::notification::{}::{}",
        session_id,
        opts.now.to_rfc3339(),
        info.message.as_deref().unwrap_or_default()
    ));
    let (message, message_meta) = truncate_text(info.message.as_deref().unwrap_or_default(), opts.max_chars);
    let details = info.details.as_ref().map(|d| truncate_value(d, opts.max_chars).0);
    let input = json!({
        "notification_type": info.notification_type,
        "message": message,
        "details": details,
    });

    let mut obs = Observation::new(
        &trace_id,
        "event",
        ObservationKind::Event,
        "Notification",
        opts.now + Duration::milliseconds(1),
    );
    obs.input = Some(input.clone());
    obs.metadata = json!({"message_meta": message_meta});

    TurnTrace {
        trace_id,
        name: "Claude Code - Notification".to_string(),
        session_id: session_id.to_string(),
        user_id: opts.user_id.clone(),
        tags: opts.tags(&[NOTIFICATION_TAG]),
        timestamp: opts.now,
        input: Some(input),
        output: None,
        metadata: json!({
            "source": SOURCE,
            "session_id": session_id,
            "hostname": opts.hostname,
            "hook_event": opts.hook_event.as_str(),
            "notification_type": info.notification_type,
            "cwd": opts.cwd,
            "permission_mode": opts.permission_mode,
            "transcript_path": opts.transcript_path,
        }),
        observations: vec![obs],
    }
}
