//! Batch submission with log-and-continue error handling
//!
//! A failed submission only loses that cycle's points; the next cycle
//! carries fresh readings, so nothing is re-sent and nothing propagates.

use tracing::{error, info, warn};

use crate::series::SubmissionBatch;
use crate::sink::{MetricSink, SinkError};

/// What happened to one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    /// Empty batch, nothing sent
    Skipped,
    /// Number of series accepted by the backend
    Submitted(usize),
    /// Number of series lost to a failed submission
    Dropped(usize),
}

pub struct Exporter<'a, S> {
    sink: &'a S,
    project: String,
}

impl<'a, S: MetricSink> Exporter<'a, S> {
    pub fn new(sink: &'a S, project: impl Into<String>) -> Self {
        Self { sink, project: project.into() }
    }

    pub async fn submit(&self, batch: &SubmissionBatch) -> ExportOutcome {
        if batch.is_empty() {
            return ExportOutcome::Skipped;
        }

        match self.sink.submit(&self.project, batch).await {
            Ok(()) => {
                info!("Successfully logged {} time series", batch.len());
                ExportOutcome::Submitted(batch.len())
            }
            Err(e) => {
                match &e {
                    SinkError::Transient { .. } => {
                        warn!("Dropping {} time series, backend unavailable: {}", batch.len(), e)
                    }
                    SinkError::RetryExhausted { attempts, .. } => {
                        warn!("Retry attempts to create time series failed ({} attempts): {}", attempts, e)
                    }
                    _ => error!("Create time series failed, dropping {} series: {}", batch.len(), e),
                }
                ExportOutcome::Dropped(batch.len())
            }
        }
    }
}
