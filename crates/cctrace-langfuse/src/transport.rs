//! Backend transport
//!
//! [`Transport`] is the seam between trace rendering and the network.
//! [`HttpTransport`] talks to a Langfuse server; [`RecordingTransport`]
//! keeps batches in memory for dry runs and tests.

use std::cell::RefCell;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::ingestion::{IngestionBatch, IngestionFailure, IngestionResponse};

pub const HEALTH_PATH: &str = "/api/public/health";
pub const INGESTION_PATH: &str = "/api/public/ingestion";

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("{failed} event(s) rejected, first: {first}")]
    Partial {
        failed: usize,
        first: String,
        retryable: bool,
    },

    #[error("Invalid backend URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    /// Whether sending the same events again can succeed.
    ///
    /// Validation failures and oversized requests are permanent; server
    /// errors, auth, throttling and network errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Rejected { status, .. } => !is_permanent_status(*status),
            TransportError::Partial { retryable, .. } => *retryable,
            _ => true,
        }
    }
}

fn is_permanent_status(status: u16) -> bool {
    (400..500).contains(&status) && !matches!(status, 401 | 403 | 404 | 408 | 429)
}

/// Answer of the health endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

pub trait Transport {
    fn health(&self) -> Result<HealthStatus, TransportError>;

    /// Send one batch. Per-event rejections are reported as [`TransportError::Partial`].
    fn ingest(&self, batch: &IngestionBatch) -> Result<IngestionResponse, TransportError>;
}

fn check_failures(errors: &[IngestionFailure]) -> Result<(), TransportError> {
    match errors.first() {
        None => Ok(()),
        Some(first) => Err(TransportError::Partial {
            failed: errors.len(),
            first: first.to_string(),
            retryable: errors.iter().any(|e| !is_permanent_status(e.status)),
        }),
    }
}

/// Langfuse HTTP client (blocking, bounded timeout)
pub struct HttpTransport {
    client: Client,
    base_url: String,
    public_key: String,
    secret_key: String,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        public_key: &str,
        secret_key: &str,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        reqwest::Url::parse(trimmed).map_err(|e| TransportError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("cctrace/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: trimmed.to_string(),
            public_key: public_key.to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    /// Endpoint URL; keeps any path prefix of a self-hosted base URL
    fn url(&self, path: &str) -> Result<reqwest::Url, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        reqwest::Url::parse(&url).map_err(|e| TransportError::InvalidUrl {
            url,
            reason: e.to_string(),
        })
    }
}

impl Transport for HttpTransport {
    fn health(&self) -> Result<HealthStatus, TransportError> {
        let response = self.client.get(self.url(HEALTH_PATH)?).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        Ok(response.json()?)
    }

    fn ingest(&self, batch: &IngestionBatch) -> Result<IngestionResponse, TransportError> {
        debug!(events = batch.batch.len(), "Sending ingestion batch");
        let response = self
            .client
            .post(self.url(INGESTION_PATH)?)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .json(batch)
            .send()?;

        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        // Only 207 carries per-event results
        let parsed: IngestionResponse = if status == StatusCode::MULTI_STATUS {
            serde_json::from_str(&body)?
        } else {
            serde_json::from_str(&body).unwrap_or_default()
        };
        check_failures(&parsed.errors)?;
        Ok(parsed)
    }
}

/// In-memory transport: accepts every batch and keeps a copy
pub struct RecordingTransport {
    version: Option<String>,
    batches: RefCell<Vec<IngestionBatch>>,
}

impl RecordingTransport {
    /// `version` is what the health endpoint reports
    pub fn new(version: Option<&str>) -> Self {
        Self {
            version: version.map(str::to_string),
            batches: RefCell::new(Vec::new()),
        }
    }

    pub fn batches(&self) -> Vec<IngestionBatch> {
        self.batches.borrow().clone()
    }

    /// Total events across all recorded batches
    pub fn event_count(&self) -> usize {
        self.batches.borrow().iter().map(|b| b.batch.len()).sum()
    }
}

impl Transport for RecordingTransport {
    fn health(&self) -> Result<HealthStatus, TransportError> {
        Ok(HealthStatus {
            status: "OK".to_string(),
            version: self.version.clone(),
        })
    }

    fn ingest(&self, batch: &IngestionBatch) -> Result<IngestionResponse, TransportError> {
        info!(events = batch.batch.len(), "Recorded ingestion batch (not sent)");
        debug!(batch = %serde_json::to_string(batch)?, "Batch contents");
        self.batches.borrow_mut().push(batch.clone());
        Ok(IngestionResponse::default())
    }
}
