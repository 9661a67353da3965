//! Field samples and the field reader interface
//!
//! A field reader watches a set of DCGM fields and, on every poll, hands
//! back the samples collected since the previous poll:
//! device index -> field id -> samples (most recent last).

use std::collections::BTreeMap;
use std::process::ExitStatus;

use crate::catalog::FieldId;

/// Index of a GPU as reported by DCGM
pub type DeviceIndex = u32;

/// Samples returned by one poll, keyed by device then field
pub type PollResult = BTreeMap<DeviceIndex, BTreeMap<FieldId, Vec<FieldSample>>>;

/// Raw value of a field sample
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Double(f64),
    Bool(bool),
    Str(String),
}

impl FieldValue {
    /// Parse a textual reading: integers first, then floats, else a string.
    pub fn parse(text: &str) -> Self {
        if let Ok(value) = text.parse::<i64>() {
            return FieldValue::Int(value);
        }
        if let Ok(value) = text.parse::<f64>() {
            return FieldValue::Double(value);
        }
        match text {
            "true" => FieldValue::Bool(true),
            "false" => FieldValue::Bool(false),
            _ => FieldValue::Str(text.to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Int(_) => "int",
            FieldValue::Double(_) => "double",
            FieldValue::Bool(_) => "bool",
            FieldValue::Str(_) => "string",
        }
    }
}

/// One reading of one field on one device
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSample {
    pub value: FieldValue,
    /// Microseconds since the Unix epoch
    pub timestamp_us: i64,
    /// No real reading yet
    pub is_blank: bool,
}

impl FieldSample {
    pub fn new(value: FieldValue, timestamp_us: i64) -> Self {
        Self { value, timestamp_us, is_blank: false }
    }

    pub fn blank(timestamp_us: i64) -> Self {
        Self {
            value: FieldValue::Str(String::new()),
            timestamp_us,
            is_blank: true,
        }
    }
}

/// Errors raised by a field reader
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("Failed to start field watcher: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Field watcher has no output stream")]
    NoOutput,
    #[error("Field watcher exited: {0}")]
    Exited(ExitStatus),
    #[error("Malformed watcher output: {0}")]
    Parse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens watch sessions on the telemetry source
#[allow(async_fn_in_trait)]
pub trait FieldReader {
    type Session: WatchSession;

    /// Start watching `field_ids` under `group_name`, sampled every
    /// `update_frequency_us` microseconds.
    async fn open(
        &self,
        field_ids: &[FieldId],
        group_name: &str,
        update_frequency_us: u64,
    ) -> Result<Self::Session, ReaderError>;
}

/// An open watch on the telemetry source
#[allow(async_fn_in_trait)]
pub trait WatchSession {
    /// Samples collected since the previous poll
    async fn poll(&mut self) -> Result<PollResult, ReaderError>;

    /// Release the watch. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), ReaderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values() {
        assert_eq!(FieldValue::parse("42"), FieldValue::Int(42));
        assert_eq!(FieldValue::parse("-7"), FieldValue::Int(-7));
        assert_eq!(FieldValue::parse("25.43"), FieldValue::Double(25.43));
        assert_eq!(FieldValue::parse("true"), FieldValue::Bool(true));
        assert_eq!(FieldValue::parse("P0"), FieldValue::Str("P0".to_string()));
    }

    #[test]
    fn test_blank_sample() {
        let sample = FieldSample::blank(1_000);
        assert!(sample.is_blank);
        assert_eq!(sample.timestamp_us, 1_000);
        assert!(!FieldSample::new(FieldValue::Int(1), 1_000).is_blank);
    }
}
