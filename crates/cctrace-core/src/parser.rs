//! JSONL parsing for transcript lines
//!
//! Claude Code writes one JSON object per line. Conversational lines
//! (`user`, `assistant`, `system`) are normalized into [`TranscriptRecord`];
//! bookkeeping lines (`summary`, `progress`, `file-history-snapshot`, ...)
//! are recognized and ignored.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::types::{MessageContent, Role, TokenUsage, TranscriptRecord};

/// Version of the transcript line schema understood by this parser
pub const SCHEMA_VERSION: u32 = 1;

/// A transcript line that could not be turned into a record
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line is not a JSON object")]
    NotAnObject,

    #[error("{role} record has malformed content: {source}")]
    Content {
        role: Role,
        #[source]
        source: serde_json::Error,
    },
}

/// Raw line shape as written by Claude Code
#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(rename = "sessionId", alias = "session_id", default)]
    session_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    message: Option<serde_json::Value>,
    /// System lines carry their text at the top level
    #[serde(default)]
    content: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Option<serde_json::Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

fn role_from(name: Option<&str>) -> Option<Role> {
    match name {
        Some("user") => Some(Role::User),
        Some("assistant") => Some(Role::Assistant),
        Some("system") => Some(Role::System),
        _ => None,
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a single JSONL line.
///
/// Returns `Ok(None)` for well-formed lines that are not part of the
/// conversation, `Err` for lines that are malformed.
pub fn parse_line(raw: &str) -> Result<Option<TranscriptRecord>, ParseError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(ParseError::NotAnObject);
    }
    let line: RawLine = serde_json::from_value(value)?;

    let message: Option<RawMessage> = match line.message {
        Some(serde_json::Value::Object(map)) => {
            Some(serde_json::from_value(serde_json::Value::Object(map))?)
        }
        _ => None,
    };

    // Line type wins; fall back to the message role
    let role = match role_from(line.kind.as_deref())
        .or_else(|| role_from(message.as_ref().and_then(|m| m.role.as_deref())))
    {
        Some(role) => role,
        None => return Ok(None),
    };

    let raw_content = message
        .as_ref()
        .and_then(|m| m.content.clone())
        .or(line.content)
        .unwrap_or(serde_json::Value::Null);

    let content = if raw_content.is_null() {
        Vec::new()
    } else {
        serde_json::from_value::<MessageContent>(raw_content)
            .map_err(|source| ParseError::Content { role, source })?
            .into_blocks()
    };

    let (message_id, model, usage, stop_reason) = match message {
        Some(m) => (m.id, m.model, m.usage, m.stop_reason),
        None => (None, None, None, None),
    };

    Ok(Some(TranscriptRecord {
        role,
        content,
        timestamp: parse_timestamp(line.timestamp.as_deref()),
        session_id: line.session_id.filter(|s| !s.is_empty()),
        uuid: line.uuid.filter(|s| !s.is_empty()),
        message_id: message_id.filter(|s| !s.is_empty()),
        model,
        usage,
        stop_reason,
        cwd: line.cwd,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentBlock;

    #[test]
    fn test_parse_user_line() {
        let raw = r#"{"type":"user","uuid":"abc","sessionId":"123","timestamp":"2024-01-01T00:00:00Z","message":{"role":"user","content":"Hello"}}"#;
        let rec = parse_line(raw).unwrap().unwrap();
        assert_eq!(rec.role, Role::User);
        assert_eq!(rec.text(), "Hello");
        assert_eq!(rec.session_id.as_deref(), Some("123"));
        assert!(rec.timestamp.is_some());
    }

    #[test]
    fn test_parse_assistant_line() {
        let raw = r#"{"type":"assistant","uuid":"def","sessionId":"123","timestamp":"2024-01-01T00:00:01Z","message":{"id":"msg_1","role":"assistant","model":"claude-sonnet","stop_reason":"end_turn","usage":{"input_tokens":3,"output_tokens":4},"content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Hi there!"}]}}"#;
        let rec = parse_line(raw).unwrap().unwrap();
        assert_eq!(rec.role, Role::Assistant);
        assert_eq!(rec.message_id.as_deref(), Some("msg_1"));
        assert_eq!(rec.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(rec.usage.as_ref().map(|u| u.output_tokens), Some(4));
        assert_eq!(rec.content.len(), 2);
        assert!(matches!(rec.content[0], ContentBlock::Thinking { .. }));
    }

    #[test]
    fn test_parse_system_line_top_level_content() {
        let raw = r#"{"type":"system","content":"You are helpful","timestamp":"2024-01-01T00:00:00Z"}"#;
        let rec = parse_line(raw).unwrap().unwrap();
        assert_eq!(rec.role, Role::System);
        assert_eq!(rec.text(), "You are helpful");
    }

    #[test]
    fn test_non_conversational_lines_are_ignored() {
        let raw = r#"{"type":"summary","summary":"Fixing bugs","leafUuid":"x"}"#;
        assert!(parse_line(raw).unwrap().is_none());
        let raw = r#"{"type":"file-history-snapshot","snapshot":{}}"#;
        assert!(parse_line(raw).unwrap().is_none());
    }

    #[test]
    fn test_malformed_lines_are_errors() {
        assert!(matches!(parse_line("not json"), Err(ParseError::Json(_))));
        assert!(matches!(parse_line("[1,2]"), Err(ParseError::NotAnObject)));
        let bad_blocks = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use"}]}}"#;
        assert!(matches!(parse_line(bad_blocks), Err(ParseError::Content { .. })));
    }

    #[test]
    fn test_role_from_message_when_type_missing() {
        let raw = r#"{"message":{"role":"assistant","content":[{"type":"text","text":"ok"}]}}"#;
        let rec = parse_line(raw).unwrap().unwrap();
        assert_eq!(rec.role, Role::Assistant);
    }
}
