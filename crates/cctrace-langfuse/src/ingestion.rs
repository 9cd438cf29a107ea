//! Langfuse public ingestion API payloads
//!
//! `POST /api/public/ingestion` takes a batch of typed events. Each event
//! has its own envelope id; the `body.id` identifies the trace or
//! observation and makes re-sent events upserts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    TraceCreate,
    SpanCreate,
    GenerationCreate,
    EventCreate,
    /// Typed observation (`TOOL`, ...), newer backends only
    ObservationCreate,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub body: EventBody,
}

impl IngestionEvent {
    pub fn new(kind: EventKind, body: EventBody) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            body,
        }
    }

    /// Id of the trace or observation this event creates
    pub fn body_id(&self) -> &str {
        match &self.body {
            EventBody::Trace(t) => &t.id,
            EventBody::Observation(o) => &o.id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventBody {
    Trace(TraceBody),
    Observation(ObservationBody),
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceBody {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationBody {
    pub id: String,
    pub trace_id: String,
    /// Observation type for `observation-create` events (`TOOL`, `SPAN`, ...)
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub observation_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_observation_id: Option<String>,
    pub name: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_details: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<LegacyUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Pre-v3 usage object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
    pub unit: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionBatch {
    pub batch: Vec<IngestionEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestionSuccess {
    pub id: String,
    #[serde(default)]
    pub status: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestionFailure {
    pub id: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl std::fmt::Display for IngestionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event {} ({})", self.id, self.status)?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

/// Per-event result of an ingestion call (HTTP 207)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestionResponse {
    #[serde(default)]
    pub successes: Vec<IngestionSuccess>,
    #[serde(default)]
    pub errors: Vec<IngestionFailure>,
}
