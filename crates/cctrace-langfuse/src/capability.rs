//! Backend capability probe and trace shape selection

use std::str::FromStr;

use tracing::{debug, warn};

pub use cctrace_core::TraceShape;

use crate::transport::{Transport, TransportError};

/// First backend major version with nested observations and `usageDetails`
pub const NESTED_MIN_MAJOR: u64 = 3;

/// Configured shape: probe the backend, or force one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShapePreference {
    #[default]
    Auto,
    Nested,
    Flat,
}

impl FromStr for ShapePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(ShapePreference::Auto),
            "nested" => Ok(ShapePreference::Nested),
            "flat" => Ok(ShapePreference::Flat),
            other => Err(format!("unknown trace shape '{}' (auto, nested, flat)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub version: Option<String>,
    pub shape: TraceShape,
    /// Send `usageDetails` instead of the legacy `usage` object
    pub usage_details: bool,
    /// Typed `observation-create` events (tool observations)
    pub typed_observations: bool,
}

impl BackendCapabilities {
    pub fn for_shape(shape: TraceShape) -> Self {
        let modern = shape == TraceShape::Nested;
        Self {
            version: None,
            shape,
            usage_details: modern,
            typed_observations: modern,
        }
    }

    /// Capabilities implied by a reported server version
    pub fn from_version(version: Option<&str>) -> Self {
        let shape = match version.and_then(major_version) {
            Some(major) if major >= NESTED_MIN_MAJOR => TraceShape::Nested,
            _ => TraceShape::Flat,
        };
        Self {
            version: version.map(str::to_string),
            ..Self::for_shape(shape)
        }
    }
}

fn major_version(version: &str) -> Option<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
}

impl ShapePreference {
    /// The shape this preference forces, if any
    pub fn forced(self) -> Option<TraceShape> {
        match self {
            ShapePreference::Auto => None,
            ShapePreference::Nested => Some(TraceShape::Nested),
            ShapePreference::Flat => Some(TraceShape::Flat),
        }
    }
}

/// Ask the health endpoint which shape the backend supports
pub fn detect(transport: &dyn Transport) -> Result<BackendCapabilities, TransportError> {
    let health = transport.health()?;
    let caps = BackendCapabilities::from_version(health.version.as_deref());
    debug!(version = ?health.version, shape = %caps.shape, "Backend probed");
    Ok(caps)
}

/// Decide the shape for this run. Only `Auto` touches the network; an
/// unreachable health endpoint falls back to the flat shape.
pub fn probe(transport: &dyn Transport, preference: ShapePreference) -> BackendCapabilities {
    if let Some(shape) = preference.forced() {
        return BackendCapabilities::for_shape(shape);
    }
    detect(transport).unwrap_or_else(|e| {
        warn!(error = %e, "Capability probe failed, using flat traces");
        BackendCapabilities::for_shape(TraceShape::Flat)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingTransport;

    #[test]
    fn test_version_selects_shape() {
        assert_eq!(BackendCapabilities::from_version(Some("3.12.0")).shape, TraceShape::Nested);
        assert_eq!(BackendCapabilities::from_version(Some("v3")).shape, TraceShape::Nested);
        assert_eq!(BackendCapabilities::from_version(Some("2.95.1")).shape, TraceShape::Flat);
        assert_eq!(BackendCapabilities::from_version(Some("garbage")).shape, TraceShape::Flat);
        assert_eq!(BackendCapabilities::from_version(None).shape, TraceShape::Flat);
    }

    #[test]
    fn test_probe_respects_preference() {
        let transport = RecordingTransport::new(Some("2.0.0"));
        assert_eq!(probe(&transport, ShapePreference::Auto).shape, TraceShape::Flat);
        assert_eq!(probe(&transport, ShapePreference::Nested).shape, TraceShape::Nested);

        let modern = RecordingTransport::new(Some("3.1.0"));
        let caps = probe(&modern, ShapePreference::Auto);
        assert_eq!(caps.shape, TraceShape::Nested);
        assert!(caps.usage_details);
        assert_eq!(caps.version.as_deref(), Some("3.1.0"));
    }

    #[test]
    fn test_detect_reports_unreachable_backend() {
        struct Down;
        impl Transport for Down {
            fn health(&self) -> Result<crate::transport::HealthStatus, TransportError> {
                Err(TransportError::Unavailable("down".into()))
            }
            fn ingest(
                &self,
                _batch: &crate::ingestion::IngestionBatch,
            ) -> Result<crate::ingestion::IngestionResponse, TransportError> {
                Err(TransportError::Unavailable("down".into()))
            }
        }
        assert!(detect(&Down).is_err());
        assert_eq!(probe(&Down, ShapePreference::Auto).shape, TraceShape::Flat);
        assert_eq!(ShapePreference::Nested.forced(), Some(TraceShape::Nested));
        assert_eq!(ShapePreference::Auto.forced(), None);
    }

    #[test]
    fn test_parse_preference() {
        assert_eq!("NESTED".parse::<ShapePreference>(), Ok(ShapePreference::Nested));
        assert_eq!("".parse::<ShapePreference>(), Ok(ShapePreference::Auto));
        assert!("tree".parse::<ShapePreference>().is_err());
    }
}
