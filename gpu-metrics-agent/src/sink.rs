//! Metrics backend interface and its error taxonomy

use crate::catalog::MetricDefinition;
use crate::series::SubmissionBatch;

/// `projects/{id}`
pub fn project_path(project_id: &str) -> String {
    format!("projects/{project_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Backend temporarily unavailable ({status}): {message}")]
    Transient { status: u16, message: String },
    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<SinkError>,
    },
    #[error("Backend rejected request ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Failed to obtain access token: {0}")]
    Auth(String),
    #[error("Failed to encode request: {0}")]
    Encode(String),
}

impl SinkError {
    /// Errors worth retrying: throttling, server side failures, timeouts
    pub fn is_transient(&self) -> bool {
        match self {
            SinkError::Transient { .. } => true,
            SinkError::Transport(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            429 | 500 | 502 | 503 | 504 => SinkError::Transient { status, message },
            _ => SinkError::Api { status, message },
        }
    }
}

/// Cloud metrics backend
#[allow(async_fn_in_trait)]
pub trait MetricSink {
    /// Register a metric descriptor. Repeated registration is assumed idempotent.
    async fn create_descriptor(&self, project: &str, definition: &MetricDefinition) -> Result<(), SinkError>;

    /// Write one batch of time series in a single call
    async fn submit(&self, project: &str, batch: &SubmissionBatch) -> Result<(), SinkError>;
}
