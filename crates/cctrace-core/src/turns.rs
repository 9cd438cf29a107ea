//! Turn assembly - groups transcript records into user-prompt-to-response turns
//!
//! Records are scanned in file order:
//! - a user prompt closes the current turn and opens the next one
//! - user records carrying `tool_result` blocks attach outputs to the current turn
//! - assistant records append their blocks, in arrival order, to the current turn
//! - system records are held and become the system prompt of the next turn
//!
//! A turn is complete when a terminal `stop_reason` was observed. Anything
//! else (interrupted sessions, a batch ending mid-response) is partial.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::truncate::sha256_hex;
use crate::types::{ContentBlock, PositionedRecord, Role, TokenUsage, TranscriptRecord};

/// Stop reason that means the model paused for a tool, not that it finished
const NON_TERMINAL_STOP: &str = "tool_use";

/// Separator between consecutive system prompts of one turn
const SYSTEM_SEPARATOR: &str = "\n---\n";

/// Whether a turn saw its terminating response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Complete,
    Partial,
}

/// One content block of a turn, stamped with its record's time
#[derive(Debug, Clone, PartialEq)]
pub struct TurnBlock {
    pub block: ContentBlock,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Output of a tool call, taken from a `tool_result` block
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultEntry {
    pub content: serde_json::Value,
    pub is_error: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A user prompt and everything the assistant did in response
#[derive(Debug, Clone)]
pub struct Turn {
    /// Deterministic identity: session + first user record
    pub turn_id: String,
    pub session_id: String,
    pub user: TranscriptRecord,
    /// Byte offset of the user record in the transcript
    pub user_offset: u64,
    pub system_prompt: Option<String>,
    /// Assistant blocks in transcript order
    pub blocks: Vec<TurnBlock>,
    /// Tool outputs keyed by tool_use id
    pub tool_results: HashMap<String, ToolResultEntry>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub stop_reason: Option<String>,
    pub status: TurnStatus,
    pub assistant_records: usize,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn is_partial(&self) -> bool {
        self.status == TurnStatus::Partial
    }

    /// True when the assistant never answered
    pub fn is_user_only(&self) -> bool {
        self.assistant_records == 0
    }

    pub fn user_text(&self) -> String {
        self.user.text()
    }

    /// All assistant text blocks joined with newlines
    pub fn assistant_text(&self) -> String {
        let mut parts = Vec::new();
        for b in &self.blocks {
            if let ContentBlock::Text { text } = &b.block {
                if !text.trim().is_empty() {
                    parts.push(text.as_str());
                }
            }
        }
        parts.join("\n")
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.user.timestamp
    }

    /// Count blocks of one kind (`"text"`, `"thinking"`, `"tool_use"`, ...)
    pub fn count_blocks(&self, kind: &str) -> usize {
        self.blocks.iter().filter(|b| b.block.kind() == kind).count()
    }
}

/// Identity of a turn: hash of the session and the first user record.
///
/// The record's UUID is used when present, its byte offset otherwise, so a
/// turn re-read in a later run maps to the same id.
pub fn turn_identity(session_id: &str, user: &TranscriptRecord, user_offset: u64) -> String {
    let anchor = match &user.uuid {
        Some(uuid) => format!("uuid:{}", uuid),
        None => format!("offset:{}", user_offset),
    };
    let digest = sha256_hex(&format!("{}::{}", session_id, anchor));
    digest[..32].to_string()
}

fn is_terminal(stop_reason: Option<&str>) -> bool {
    matches!(stop_reason, Some(r) if r != NON_TERMINAL_STOP)
}

/// Turn under construction
struct OpenTurn {
    user: TranscriptRecord,
    user_offset: u64,
    system_prompt: Option<String>,
    blocks: Vec<TurnBlock>,
    tool_results: HashMap<String, ToolResultEntry>,
    model: Option<String>,
    /// Usage per API message id, last value wins; insertion order kept
    usage_by_message: Vec<(String, TokenUsage)>,
    stop_reason: Option<String>,
    assistant_records: usize,
    ended_at: Option<DateTime<Utc>>,
}

impl OpenTurn {
    fn close(self, session_id: &str) -> Turn {
        let session_id = self
            .user
            .session_id
            .clone()
            .unwrap_or_else(|| session_id.to_string());

        let usage = if self.usage_by_message.is_empty() {
            None
        } else {
            let mut total = TokenUsage::default();
            for (_, u) in &self.usage_by_message {
                total.accumulate(u);
            }
            Some(total)
        };

        let status = if is_terminal(self.stop_reason.as_deref()) {
            TurnStatus::Complete
        } else {
            TurnStatus::Partial
        };

        Turn {
            turn_id: turn_identity(&session_id, &self.user, self.user_offset),
            session_id,
            user: self.user,
            user_offset: self.user_offset,
            system_prompt: self.system_prompt,
            blocks: self.blocks,
            tool_results: self.tool_results,
            model: self.model,
            usage,
            stop_reason: self.stop_reason,
            status,
            assistant_records: self.assistant_records,
            ended_at: self.ended_at,
        }
    }
}

/// Incremental turn builder. Feed records in file order, then [`finish`](Self::finish).
pub struct TurnBuilder {
    session_id: String,
    turns: Vec<Turn>,
    current: Option<OpenTurn>,
    pending_system: Vec<String>,
    orphans: usize,
}

impl TurnBuilder {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            turns: Vec::new(),
            current: None,
            pending_system: Vec::new(),
            orphans: 0,
        }
    }

    /// Records that arrived with no user prompt to attach to
    pub fn orphans(&self) -> usize {
        self.orphans
    }

    pub fn push(&mut self, positioned: PositionedRecord) {
        let PositionedRecord { offset, record, .. } = positioned;
        match record.role {
            Role::System => {
                let text = record.text();
                if !text.trim().is_empty() {
                    self.pending_system.push(text);
                }
            }
            Role::User if record.is_tool_result() => self.push_tool_results(record),
            Role::User => self.start_turn(record, offset),
            Role::Assistant => self.push_assistant(record),
        }
    }

    fn start_turn(&mut self, user: TranscriptRecord, offset: u64) {
        if let Some(open) = self.current.take() {
            self.turns.push(open.close(&self.session_id));
        }
        let system_prompt = if self.pending_system.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending_system).join(SYSTEM_SEPARATOR))
        };
        self.current = Some(OpenTurn {
            ended_at: user.timestamp,
            user,
            user_offset: offset,
            system_prompt,
            blocks: Vec::new(),
            tool_results: HashMap::new(),
            model: None,
            usage_by_message: Vec::new(),
            stop_reason: None,
            assistant_records: 0,
        });
    }

    fn push_tool_results(&mut self, record: TranscriptRecord) {
        let Some(open) = self.current.as_mut() else {
            self.orphans += 1;
            return;
        };
        for block in record.content {
            if let ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = block
            {
                open.tool_results.insert(
                    tool_use_id,
                    ToolResultEntry {
                        content,
                        is_error,
                        timestamp: record.timestamp,
                    },
                );
            }
        }
        if record.timestamp.is_some() {
            open.ended_at = record.timestamp;
        }
    }

    fn push_assistant(&mut self, record: TranscriptRecord) {
        let Some(open) = self.current.as_mut() else {
            self.orphans += 1;
            return;
        };

        open.assistant_records += 1;
        if open.model.is_none() {
            open.model = record.model.clone();
        }
        if record.stop_reason.is_some() {
            open.stop_reason = record.stop_reason.clone();
        }
        if record.timestamp.is_some() {
            open.ended_at = record.timestamp;
        }

        if let Some(usage) = record.usage {
            let key = record
                .message_id
                .clone()
                .unwrap_or_else(|| format!("noid:{}", open.assistant_records));
            match open.usage_by_message.iter_mut().find(|(id, _)| *id == key) {
                Some(entry) => entry.1 = usage,
                None => open.usage_by_message.push((key, usage)),
            }
        }

        for block in record.content {
            open.blocks.push(TurnBlock {
                block,
                timestamp: record.timestamp,
            });
        }
    }

    /// Close the last turn and return all turns in order
    pub fn finish(mut self) -> Vec<Turn> {
        if let Some(open) = self.current.take() {
            self.turns.push(open.close(&self.session_id));
        }
        self.turns
    }
}

/// Build turns from records in file order
pub fn build_turns<I>(session_id: &str, records: I) -> Vec<Turn>
where
    I: IntoIterator<Item = PositionedRecord>,
{
    let mut builder = TurnBuilder::new(session_id);
    for record in records {
        builder.push(record);
    }
    builder.finish()
}
