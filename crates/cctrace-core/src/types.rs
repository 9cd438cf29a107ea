//! Core type definitions for transcript records and hook events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::correlate::fingerprint;

/// Token usage statistics for a message
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
}

impl TokenUsage {
    /// Billable total (input + output)
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Add another usage record into this one
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens =
            add_optional(self.cache_creation_input_tokens, other.cache_creation_input_tokens);
        self.cache_read_input_tokens =
            add_optional(self.cache_read_input_tokens, other.cache_read_input_tokens);
    }
}

fn add_optional(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

/// Content block types that can appear in messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Any block kind this schema version does not know (images, redacted
    /// thinking, server tools...). Kept so block order stays intact.
    #[serde(other)]
    Unknown,
}

impl ContentBlock {
    /// Short kind name used in span metadata
    pub fn kind(&self) -> &'static str {
        match self {
            ContentBlock::Text { .. } => "text",
            ContentBlock::Thinking { .. } => "thinking",
            ContentBlock::ToolUse { .. } => "tool_use",
            ContentBlock::ToolResult { .. } => "tool_result",
            ContentBlock::Unknown => "unknown",
        }
    }
}

/// Message content can be a string or array of content blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Normalize into an ordered block list. A bare string becomes one text block.
    pub fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(s) if s.is_empty() => Vec::new(),
            MessageContent::Text(s) => vec![ContentBlock::Text { text: s }],
            MessageContent::Blocks(blocks) => blocks,
        }
    }
}

/// Speaker of a transcript record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// One conversational line of a transcript, normalized
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptRecord {
    pub role: Role,
    /// Ordered content blocks
    pub content: Vec<ContentBlock>,
    pub timestamp: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    /// Line UUID
    pub uuid: Option<String>,
    /// API message id; streamed assistant lines share it
    pub message_id: Option<String>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub stop_reason: Option<String>,
    pub cwd: Option<String>,
}

impl TranscriptRecord {
    /// True for user records that only relay tool results back to the model
    pub fn is_tool_result(&self) -> bool {
        self.role == Role::User
            && self
                .content
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }

    /// Text blocks joined with newlines
    pub fn text(&self) -> String {
        let mut parts = Vec::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                if !text.is_empty() {
                    parts.push(text.as_str());
                }
            }
        }
        parts.join("\n")
    }
}

/// A transcript record together with its byte span in the file
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedRecord {
    /// Byte offset of the first byte of the line
    pub offset: u64,
    /// Byte offset just past the terminating newline
    pub end_offset: u64,
    pub record: TranscriptRecord,
}

/// The four hook events that trigger a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEventKind {
    Stop,
    Notification,
    PreToolUse,
    PostToolUse,
}

impl HookEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEventKind::Stop => "Stop",
            HookEventKind::Notification => "Notification",
            HookEventKind::PreToolUse => "PreToolUse",
            HookEventKind::PostToolUse => "PostToolUse",
        }
    }

    /// Parse a declared `hook_event_name`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "Stop" => Some(HookEventKind::Stop),
            "Notification" => Some(HookEventKind::Notification),
            "PreToolUse" => Some(HookEventKind::PreToolUse),
            "PostToolUse" => Some(HookEventKind::PostToolUse),
            _ => None,
        }
    }

    /// Events that only feed the tool buffer
    pub fn is_tool_event(&self) -> bool {
        matches!(self, HookEventKind::PreToolUse | HookEventKind::PostToolUse)
    }

    /// Tool phase reported by this event, if it is a tool event
    pub fn tool_phase(&self) -> Option<ToolPhase> {
        match self {
            HookEventKind::PreToolUse => Some(ToolPhase::Before),
            HookEventKind::PostToolUse => Some(ToolPhase::After),
            _ => None,
        }
    }
}

impl std::fmt::Display for HookEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How observations hang off a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceShape {
    /// Root span per trace, every observation a child of it
    Nested,
    /// Observations attached directly to the trace
    Flat,
}

impl std::fmt::Display for TraceShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceShape::Nested => write!(f, "nested"),
            TraceShape::Flat => write!(f, "flat"),
        }
    }
}

/// Which side of a tool invocation an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPhase {
    Before,
    After,
}

/// A real-time tool event delivered by a PreToolUse/PostToolUse hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    /// Unique id of this buffered event
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub phase: ToolPhase,
    /// Claude Code's tool_use id, when the hook payload carries it
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    /// Tool name + input fingerprint
    pub correlation_key: String,
}

impl ToolEvent {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
        phase: ToolPhase,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let tool_name = tool_name.into();
        let correlation_key = fingerprint(&tool_name, &serde_json::Value::Null);
        Self {
            id: id.into(),
            session_id: session_id.into(),
            tool_name,
            phase,
            tool_use_id: None,
            input: serde_json::Value::Null,
            output: None,
            timestamp,
            correlation_key,
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.correlation_key = fingerprint(&self.tool_name, &input);
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: Option<serde_json::Value>) -> Self {
        self.output = output;
        self
    }

    pub fn with_tool_use_id(mut self, tool_use_id: Option<String>) -> Self {
        self.tool_use_id = tool_use_id.filter(|s| !s.is_empty());
        self
    }
}
