//! Trace emitter: collects a run's traces and sends them in bounded batches
//!
//! A chunk the backend refuses for good (validation failure, request too
//! large) is logged and counted as dropped so the run can still commit.
//! Any other failure aborts the flush; chunks already sent are re-sent on
//! the retry and update the same objects.

use serde_json::json;
use tracing::{debug, info, warn};

use crate::capability::TraceShape;
use crate::ingestion::{IngestionBatch, IngestionEvent};
use crate::sink::TraceSink;
use crate::trace::TurnTrace;
use crate::transport::{Transport, TransportError};

/// Events per ingestion request
pub const MAX_BATCH_EVENTS: usize = 200;
/// Serialized bytes per ingestion request, below the backend's body limit
pub const MAX_BATCH_BYTES: usize = 3_000_000;

/// What a flush sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub traces: usize,
    /// Events the backend accepted
    pub events: usize,
    /// Events the backend refused for good
    pub dropped: usize,
    pub batches: usize,
}

pub struct TraceEmitter<'a> {
    sink: Box<dyn TraceSink>,
    transport: &'a dyn Transport,
    pending: Vec<IngestionEvent>,
    traces: usize,
    max_events: usize,
    max_bytes: usize,
}

impl<'a> TraceEmitter<'a> {
    pub fn new(sink: Box<dyn TraceSink>, transport: &'a dyn Transport) -> Self {
        Self {
            sink,
            transport,
            pending: Vec::new(),
            traces: 0,
            max_events: MAX_BATCH_EVENTS,
            max_bytes: MAX_BATCH_BYTES,
        }
    }

    pub fn with_batch_limits(mut self, max_events: usize, max_bytes: usize) -> Self {
        self.max_events = max_events.max(1);
        self.max_bytes = max_bytes.max(1);
        self
    }

    pub fn shape(&self) -> TraceShape {
        self.sink.shape()
    }

    pub fn queue(&mut self, trace: &TurnTrace) {
        let events = self.sink.render(trace);
        debug!(trace = %trace.name, id = %trace.trace_id, events = events.len(), "Queued trace");
        self.pending.extend(events);
        self.traces += 1;
    }

    pub fn queued_traces(&self) -> usize {
        self.traces
    }

    /// Send everything queued. Nothing queued, nothing sent.
    pub fn flush(&mut self) -> Result<FlushReport, TransportError> {
        if self.pending.is_empty() {
            return Ok(FlushReport::default());
        }
        let mut report = FlushReport {
            traces: std::mem::take(&mut self.traces),
            ..Default::default()
        };
        let chunks = chunk_events(std::mem::take(&mut self.pending), self.max_events, self.max_bytes)?;
        let total = chunks.len();

        for (i, chunk) in chunks.into_iter().enumerate() {
            let size = chunk.len();
            let batch = IngestionBatch {
                batch: chunk,
                metadata: Some(json!({
                    "sdk_name": "cctrace",
                    "sdk_version": env!("CARGO_PKG_VERSION"),
                    "shape": self.sink.shape().to_string(),
                    "chunk": i + 1,
                    "chunks": total,
                })),
            };
            report.batches += 1;
            match self.transport.ingest(&batch) {
                Ok(response) => {
                    report.events += size;
                    debug!(chunk = i + 1, events = size, accepted = response.successes.len(), "Batch accepted");
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    let dropped = match &e {
                        TransportError::Partial { failed, .. } => (*failed).min(size),
                        _ => size,
                    };
                    warn!(error = %e, chunk = i + 1, dropped, "Backend refused events permanently, dropping them");
                    report.events += size - dropped;
                    report.dropped += dropped;
                }
            }
        }

        info!(
            traces = report.traces,
            events = report.events,
            dropped = report.dropped,
            batches = report.batches,
            "Flushed traces"
        );
        Ok(report)
    }
}

/// Split events into chunks of at most `max_events` events and about
/// `max_bytes` serialized bytes. An event larger than `max_bytes` travels alone.
fn chunk_events(
    events: Vec<IngestionEvent>,
    max_events: usize,
    max_bytes: usize,
) -> Result<Vec<Vec<IngestionEvent>>, serde_json::Error> {
    let mut chunks = Vec::new();
    let mut current: Vec<IngestionEvent> = Vec::new();
    let mut bytes = 0;
    for event in events {
        let size = serde_json::to_vec(&event)?.len();
        if !current.is_empty() && (current.len() >= max_events || bytes + size > max_bytes) {
            chunks.push(std::mem::take(&mut current));
            bytes = 0;
        }
        bytes += size;
        current.push(event);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}
