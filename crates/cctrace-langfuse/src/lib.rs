//! cctrace-langfuse - Langfuse output for Claude Code turns
//!
//! Turns become [`TurnTrace`]s, a [`TraceSink`] renders them in the shape
//! the backend supports, and a [`Transport`] delivers the batch.

pub mod capability;
pub mod emitter;
pub mod ingestion;
pub mod sink;
pub mod trace;
pub mod transport;

pub use capability::{detect, probe, BackendCapabilities, ShapePreference, TraceShape};
pub use emitter::{FlushReport, TraceEmitter};
pub use ingestion::{EventBody, EventKind, IngestionBatch, IngestionEvent, IngestionResponse};
pub use sink::{select_sink, FlatSink, NestedSink, TraceSink};
pub use trace::{
    build_notification_trace, build_standalone_tool_trace, build_turn_trace, NotificationInfo,
    Observation, ObservationKind, TraceOptions, TurnTrace,
};
pub use transport::{HealthStatus, HttpTransport, RecordingTransport, Transport, TransportError};
