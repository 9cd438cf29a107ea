//! Tool event correlation
//!
//! PreToolUse/PostToolUse hooks deliver tool events out of band. Each
//! invocation moves through `Pending -> Matched -> Emitted`:
//! - Before and After events are paired first (first unmatched Before pairs
//!   with the first later After of the same invocation)
//! - invocations are then matched to `tool_use` blocks of a turn, by
//!   tool_use id when both sides carry one, by tool name + input fingerprint
//!   otherwise
//! - whatever is left is re-buffered, or emitted standalone once stale

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::truncate::sha256_hex;
use crate::turns::Turn;
use crate::types::{ContentBlock, ToolEvent, ToolPhase};

/// How far before a turn's user prompt a tool event may start and still
/// belong to that turn (clock skew between hook and transcript writer)
pub const MATCH_SLACK_SECS: i64 = 120;

/// Fingerprint of a tool call: tool name plus canonical JSON of its input
pub fn fingerprint(tool_name: &str, input: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(input, &mut canonical);
    let digest = sha256_hex(&format!("{}\0{}", tool_name, canonical));
    digest[..16].to_string()
}

/// Serialize with object keys sorted so key order never changes the fingerprint
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationState {
    /// Before seen, nothing else yet
    Pending,
    /// Paired with an After event or a transcript tool_use
    Matched,
    /// Sent to the backend
    Emitted,
}

/// One tool call reconstructed from buffered events
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub key: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_use_id: Option<String>,
    pub input: Value,
    pub output: Option<Value>,
    /// Ids of the buffered events this invocation consumed
    pub event_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: InvocationState,
}

impl ToolInvocation {
    fn from_event(event: &ToolEvent) -> Self {
        let (output, finished_at, state) = match event.phase {
            ToolPhase::Before => (None, None, InvocationState::Pending),
            ToolPhase::After => (
                event.output.clone(),
                Some(event.timestamp),
                InvocationState::Matched,
            ),
        };
        Self {
            key: event.correlation_key.clone(),
            session_id: event.session_id.clone(),
            tool_name: event.tool_name.clone(),
            tool_use_id: event.tool_use_id.clone(),
            input: event.input.clone(),
            output,
            event_ids: vec![event.id.clone()],
            started_at: event.timestamp,
            finished_at,
            state,
        }
    }

    fn accepts_after(&self, after: &ToolEvent) -> bool {
        if self.state != InvocationState::Pending {
            return false;
        }
        match (&self.tool_use_id, &after.tool_use_id) {
            (Some(a), Some(b)) => a == b,
            _ => self.key == after.correlation_key,
        }
    }

    fn complete_with(&mut self, after: &ToolEvent) {
        self.output = after.output.clone();
        self.finished_at = Some(after.timestamp);
        if self.tool_use_id.is_none() {
            self.tool_use_id = after.tool_use_id.clone();
        }
        self.event_ids.push(after.id.clone());
        self.state = InvocationState::Matched;
    }

    pub fn mark_emitted(&mut self) {
        self.state = InvocationState::Emitted;
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    fn matches_block(&self, tool_use_id: &str, name: &str, key: &str) -> bool {
        match self.tool_use_id.as_deref() {
            Some(id) if !tool_use_id.is_empty() => id == tool_use_id,
            _ => self.tool_name == name && self.key == key,
        }
    }
}

/// Pair Before/After events into invocations, in arrival order.
///
/// An After with no pending Before becomes an invocation on its own.
pub fn pair_tool_events(events: &[ToolEvent]) -> Vec<ToolInvocation> {
    let mut invocations: Vec<ToolInvocation> = Vec::new();
    for event in events {
        match event.phase {
            ToolPhase::Before => invocations.push(ToolInvocation::from_event(event)),
            ToolPhase::After => {
                match invocations.iter_mut().find(|inv| inv.accepts_after(event)) {
                    Some(inv) => inv.complete_with(event),
                    None => invocations.push(ToolInvocation::from_event(event)),
                }
            }
        }
    }
    invocations
}

/// A buffered invocation matched to a `tool_use` block of a turn
#[derive(Debug, Clone)]
pub struct TurnToolMatch {
    /// Index into `Turn::blocks`
    pub block_index: usize,
    pub invocation: ToolInvocation,
}

/// Result of correlating one run's buffered events
#[derive(Debug, Default)]
pub struct CorrelationReport {
    pub matched: usize,
    pub unmatched: Vec<ToolInvocation>,
}

/// Matches buffered invocations against turns of the current run
pub struct Correlator {
    invocations: Vec<ToolInvocation>,
    claimed: HashSet<usize>,
}

impl Correlator {
    pub fn new(events: &[ToolEvent]) -> Self {
        Self {
            invocations: pair_tool_events(events),
            claimed: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.invocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
    }

    /// Claim the invocations belonging to `turn`'s tool_use blocks
    pub fn match_turn(&mut self, turn: &Turn) -> Vec<TurnToolMatch> {
        let earliest = turn
            .started_at()
            .map(|t| t - Duration::seconds(MATCH_SLACK_SECS));
        let mut matches = Vec::new();

        for (block_index, block) in turn.blocks.iter().enumerate() {
            let ContentBlock::ToolUse { id, name, input } = &block.block else {
                continue;
            };
            let key = fingerprint(name, input);
            let found = self.invocations.iter().enumerate().position(|(i, inv)| {
                !self.claimed.contains(&i)
                    && inv.matches_block(id, name, &key)
                    && earliest.map_or(true, |e| inv.started_at >= e)
            });
            if let Some(i) = found {
                self.claimed.insert(i);
                let mut invocation = self.invocations[i].clone();
                invocation.state = InvocationState::Matched;
                matches.push(TurnToolMatch {
                    block_index,
                    invocation,
                });
            }
        }
        matches
    }

    /// Invocations no turn claimed, in arrival order
    pub fn finish(self) -> CorrelationReport {
        let matched = self.claimed.len();
        let unmatched = self
            .invocations
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !self.claimed.contains(i))
            .map(|(_, inv)| inv)
            .collect();
        CorrelationReport { matched, unmatched }
    }
}

/// Bound on how long unmatched events stay buffered
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    /// Unmatched events kept across the whole buffer
    pub max_events: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::seconds(3600),
            max_events: 500,
        }
    }
}

impl RetentionPolicy {
    /// Hard bound on the buffer file between Stop runs. Past it the oldest
    /// events are dropped at append time without being traced.
    pub fn buffer_limit(&self) -> usize {
        self.max_events.saturating_mul(2).max(1)
    }

    /// Split unmatched invocations into `(keep, stale)`.
    ///
    /// Invocations older than `max_age` are stale. If the rest still holds
    /// more than `max_events` events, the oldest are made stale too.
    pub fn split_stale(
        &self,
        invocations: Vec<ToolInvocation>,
        now: DateTime<Utc>,
    ) -> (Vec<ToolInvocation>, Vec<ToolInvocation>) {
        let (mut keep, mut stale): (Vec<_>, Vec<_>) = invocations
            .into_iter()
            .partition(|inv| now - inv.started_at <= self.max_age);

        keep.sort_by_key(|inv| inv.started_at);
        let mut total: usize = keep.iter().map(|inv| inv.event_ids.len()).sum();
        while total > self.max_events && !keep.is_empty() {
            let oldest = keep.remove(0);
            total -= oldest.event_ids.len();
            stale.push(oldest);
        }
        stale.sort_by_key(|inv| inv.started_at);
        (keep, stale)
    }
}
