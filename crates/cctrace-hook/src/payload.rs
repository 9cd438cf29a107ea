//! Hook payload read from stdin

use std::path::PathBuf;

use cctrace_core::{HookEventKind, ToolEvent};
use cctrace_langfuse::NotificationInfo;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// One hook invocation's JSON. Field spellings vary across Claude Code
/// versions, so aliases are kept as separate fields and resolved in accessors.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub event: Option<String>,

    #[serde(default)]
    session_id: Option<String>,
    #[serde(default, rename = "sessionId")]
    session_id_camel: Option<String>,
    #[serde(default)]
    session: Option<Value>,

    #[serde(default)]
    transcript_path: Option<String>,
    #[serde(default, rename = "transcriptPath")]
    transcript_path_camel: Option<String>,
    #[serde(default)]
    transcript: Option<Value>,

    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,

    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    tool_output: Option<Value>,
    #[serde(default)]
    tool_response: Option<Value>,
    #[serde(default)]
    pub tool_use_id: Option<String>,

    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn nested_str(value: &Option<Value>, key: &str) -> Option<String> {
    value
        .as_ref()
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Expand a leading `~` to the home directory
fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => PathBuf::from(path),
    }
}

impl HookPayload {
    /// Parse stdin contents. Empty input is an empty payload.
    pub fn parse(input: &str) -> Result<Self, serde_json::Error> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(input)
    }

    /// Declared event name, or inferred from which fields are present
    pub fn event_kind(&self) -> HookEventKind {
        let declared = self
            .hook_event_name
            .as_deref()
            .or(self.event.as_deref())
            .and_then(HookEventKind::from_name);
        if let Some(kind) = declared {
            return kind;
        }
        if self.tool_name.is_some() {
            if self.tool_output().is_some() {
                return HookEventKind::PostToolUse;
            }
            return HookEventKind::PreToolUse;
        }
        if self.notification_type.is_some() || self.details.is_some() || self.message.is_some() {
            return HookEventKind::Notification;
        }
        HookEventKind::Stop
    }

    pub fn session_id(&self) -> Option<String> {
        non_empty(&self.session_id)
            .or_else(|| non_empty(&self.session_id_camel))
            .or_else(|| nested_str(&self.session, "id"))
    }

    pub fn transcript_path(&self) -> Option<PathBuf> {
        non_empty(&self.transcript_path)
            .or_else(|| non_empty(&self.transcript_path_camel))
            .or_else(|| nested_str(&self.transcript, "path"))
            .map(|p| expand_home(&p))
    }

    /// `tool_output`, or `tool_response` as newer versions call it
    pub fn tool_output(&self) -> Option<&Value> {
        self.tool_output.as_ref().or(self.tool_response.as_ref())
    }

    /// Buffered event for a PreToolUse/PostToolUse payload
    pub fn tool_event(
        &self,
        kind: HookEventKind,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Option<ToolEvent> {
        let phase = kind.tool_phase()?;
        let tool_name = non_empty(&self.tool_name).unwrap_or_else(|| "unknown".to_string());
        let event = ToolEvent::new(uuid::Uuid::new_v4().to_string(), session_id, tool_name, phase, now)
            .with_input(self.tool_input.clone().unwrap_or(Value::Null))
            .with_output(self.tool_output().cloned())
            .with_tool_use_id(self.tool_use_id.clone());
        Some(event)
    }

    pub fn notification(&self) -> NotificationInfo {
        NotificationInfo {
            notification_type: self.notification_type.clone(),
            message: self.message.clone(),
            details: self.details.clone(),
        }
    }
}
