//! GPU Metrics Agent - DCGM telemetry to Cloud Monitoring
//!
//! The agent watches a fixed set of DCGM fields and republishes them:
//! - Metric catalog and descriptor registration at startup
//! - Resource identity resolved from the GCE metadata server
//! - Sample -> time series translation with first-poll suppression
//! - Fixed-phase poll loop with log-and-continue submission

pub mod batch;
pub mod catalog;
pub mod config;
pub mod dcgmi;
pub mod driver;
pub mod exporter;
pub mod fields;
pub mod monitoring;
pub mod registrar;
pub mod resource;
pub mod series;
pub mod sink;
pub mod translator;

pub use batch::BatchBuilder;
pub use catalog::{FieldId, MetricCatalog, MetricDefinition, MetricKind, ValueType};
pub use driver::{DriverState, LoopReport, PollLoop};
pub use exporter::{ExportOutcome, Exporter};
pub use fields::{DeviceIndex, FieldReader, FieldSample, FieldValue, PollResult, ReaderError, WatchSession};
pub use resource::{MetadataSource, ResourceIdentity, ResourceType};
pub use series::{SubmissionBatch, TimeSeries, TimeSeriesPoint, Timestamp, TypedValue};
pub use sink::{MetricSink, SinkError};
pub use translator::Translator;
