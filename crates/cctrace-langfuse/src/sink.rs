//! Rendering traces into ingestion events
//!
//! Two sinks, one per backend shape. The shape is chosen once per run, so
//! every trace of a batch has the same structure.

use serde_json::{json, Value};

use crate::capability::{BackendCapabilities, TraceShape};
use crate::ingestion::{
    EventBody, EventKind, IngestionEvent, LegacyUsage, ObservationBody, TraceBody,
};
use crate::trace::{Observation, ObservationKind, TurnTrace};

pub trait TraceSink {
    fn shape(&self) -> TraceShape;

    /// Ingestion events for one trace: the trace itself, then its observations in order
    fn render(&self, trace: &TurnTrace) -> Vec<IngestionEvent>;
}

/// Pick the sink for the probed backend
pub fn select_sink(caps: &BackendCapabilities) -> Box<dyn TraceSink> {
    match caps.shape {
        TraceShape::Nested => Box::new(NestedSink {
            usage_details: caps.usage_details,
            typed_observations: caps.typed_observations,
        }),
        TraceShape::Flat => Box::new(FlatSink {
            usage_details: caps.usage_details,
        }),
    }
}

fn root_id(trace: &TurnTrace) -> String {
    format!("{}-root", trace.trace_id)
}

fn observation_event(
    trace: &TurnTrace,
    obs: &Observation,
    parent: Option<String>,
    usage_details: bool,
    typed_observations: bool,
) -> IngestionEvent {
    let mut body = ObservationBody {
        id: obs.id.clone(),
        trace_id: trace.trace_id.clone(),
        parent_observation_id: parent,
        name: obs.name.clone(),
        start_time: obs.start_time,
        end_time: obs.end_time,
        input: obs.input.clone(),
        output: obs.output.clone(),
        metadata: (!obs.metadata.is_null()).then(|| obs.metadata.clone()),
        model: obs.model.clone(),
        level: obs.level.clone(),
        ..Default::default()
    };

    if let Some(usage) = &obs.usage {
        if usage_details {
            body.usage_details = Some(usage.details());
        } else {
            body.usage = Some(LegacyUsage {
                input: usage.input,
                output: usage.output,
                total: usage.total,
                unit: "TOKENS".to_string(),
            });
        }
    }

    let kind = match obs.kind {
        ObservationKind::Span => EventKind::SpanCreate,
        ObservationKind::Generation => EventKind::GenerationCreate,
        ObservationKind::Event => EventKind::EventCreate,
        ObservationKind::Tool if typed_observations => {
            body.observation_type = Some("TOOL".to_string());
            EventKind::ObservationCreate
        }
        ObservationKind::Tool => {
            let mut metadata = body.metadata.take().unwrap_or_else(|| json!({}));
            if let Value::Object(map) = &mut metadata {
                map.insert("observation_type".to_string(), json!("tool"));
            }
            body.metadata = Some(metadata);
            EventKind::SpanCreate
        }
    };
    IngestionEvent::new(kind, EventBody::Observation(body))
}

/// Root span per trace; every observation is its child
pub struct NestedSink {
    pub usage_details: bool,
    pub typed_observations: bool,
}

impl TraceSink for NestedSink {
    fn shape(&self) -> TraceShape {
        TraceShape::Nested
    }

    fn render(&self, trace: &TurnTrace) -> Vec<IngestionEvent> {
        let root = root_id(trace);
        let mut events = Vec::with_capacity(trace.observations.len() + 2);

        // Trace carries identity and grouping; content lives on the root span
        events.push(IngestionEvent::new(
            EventKind::TraceCreate,
            EventBody::Trace(TraceBody {
                id: trace.trace_id.clone(),
                timestamp: trace.timestamp,
                name: trace.name.clone(),
                user_id: Some(trace.user_id.clone()),
                session_id: trace.session_id.clone(),
                input: trace.input.clone(),
                output: trace.output.clone(),
                metadata: None,
                tags: trace.tags.clone(),
            }),
        ));
        events.push(IngestionEvent::new(
            EventKind::SpanCreate,
            EventBody::Observation(ObservationBody {
                id: root.clone(),
                trace_id: trace.trace_id.clone(),
                name: trace.name.clone(),
                start_time: trace.timestamp,
                end_time: Some(trace.end_time()),
                input: trace.input.clone(),
                output: trace.output.clone(),
                metadata: Some(trace.metadata.clone()),
                ..Default::default()
            }),
        ));
        for obs in &trace.observations {
            events.push(observation_event(
                trace,
                obs,
                Some(root.clone()),
                self.usage_details,
                self.typed_observations,
            ));
        }
        events
    }
}

/// Observations attached directly to the trace
pub struct FlatSink {
    pub usage_details: bool,
}

impl TraceSink for FlatSink {
    fn shape(&self) -> TraceShape {
        TraceShape::Flat
    }

    fn render(&self, trace: &TurnTrace) -> Vec<IngestionEvent> {
        let mut events = Vec::with_capacity(trace.observations.len() + 1);
        events.push(IngestionEvent::new(
            EventKind::TraceCreate,
            EventBody::Trace(TraceBody {
                id: trace.trace_id.clone(),
                timestamp: trace.timestamp,
                name: trace.name.clone(),
                user_id: Some(trace.user_id.clone()),
                session_id: trace.session_id.clone(),
                input: trace.input.clone(),
                output: trace.output.clone(),
                metadata: Some(trace.metadata.clone()),
                tags: trace.tags.clone(),
            }),
        ));
        for obs in &trace.observations {
            events.push(observation_event(trace, obs, None, self.usage_details, false));
        }
        events
    }
}
