//! Fixed-phase poll loop
//!
//! Each cycle polls the watch session, builds a batch and exports it.
//! Cycles are scheduled at `start + n * interval` so time spent inside a
//! cycle does not push later cycles back. The shutdown signal is only
//! honored between cycles; the watch session is released on every exit.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::batch::BatchBuilder;
use crate::exporter::{ExportOutcome, Exporter};
use crate::fields::{FieldReader, ReaderError, WatchSession};
use crate::sink::MetricSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Running,
    Stopped,
}

/// Counters reported when the loop stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub cycles: u64,
    pub failed_polls: u64,
    pub series_submitted: u64,
    pub series_dropped: u64,
}

pub struct PollLoop<'a, S> {
    builder: BatchBuilder<'a>,
    exporter: Exporter<'a, S>,
    interval: Duration,
    state: DriverState,
    report: LoopReport,
}

impl<'a, S: MetricSink> PollLoop<'a, S> {
    pub fn new(builder: BatchBuilder<'a>, exporter: Exporter<'a, S>, interval: Duration) -> Self {
        Self {
            builder,
            exporter,
            interval,
            state: DriverState::Running,
            report: LoopReport::default(),
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Open a watch on the catalog's fields, poll until `shutdown`
    /// resolves, then release the watch.
    pub async fn run<R, F>(mut self, reader: &R, group_name: &str, shutdown: F) -> Result<LoopReport, ReaderError>
    where
        R: FieldReader,
        F: Future<Output = ()>,
    {
        let field_ids = self.builder.translator().catalog().field_ids();
        let update_frequency_us = u64::try_from(self.interval.as_micros()).unwrap_or(u64::MAX);

        let mut session = reader.open(&field_ids, group_name, update_frequency_us).await?;
        info!("Watching {} fields in group {}", field_ids.len(), group_name);

        let report = self.poll_until(&mut session, shutdown).await;

        if let Err(e) = session.close().await {
            warn!("Failed to release field watch: {}", e);
        }
        Ok(report)
    }

    /// Drive cycles on an already open session until `shutdown` resolves.
    pub async fn poll_until<W, F>(&mut self, session: &mut W, shutdown: F) -> LoopReport
    where
        W: WatchSession,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.state = DriverState::Running;
        let mut next = Instant::now();

        while self.state == DriverState::Running {
            self.cycle(session).await;

            next += self.interval;
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Caught interrupt. Exiting ...");
                    self.state = DriverState::Stopped;
                }
                _ = sleep_until(next) => {}
            }
        }

        self.report.clone()
    }

    async fn cycle<W: WatchSession>(&mut self, session: &mut W) {
        self.report.cycles += 1;

        let poll = match session.poll().await {
            Ok(poll) => poll,
            Err(e) => {
                self.report.failed_polls += 1;
                warn!("Field poll failed, skipping cycle: {}", e);
                return;
            }
        };

        let batch = self.builder.build(&poll);
        match self.exporter.submit(&batch).await {
            ExportOutcome::Submitted(n) => self.report.series_submitted += n as u64,
            ExportOutcome::Dropped(n) => self.report.series_dropped += n as u64,
            ExportOutcome::Skipped => {}
        }
    }
}
