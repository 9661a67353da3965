//! Time series produced for the metrics backend

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::resource::ResourceIdentity;

const MICROS_PER_SECOND: i64 = 1_000_000;
const NANOS_PER_MICRO: i64 = 1_000;

/// Point in time split into whole seconds and nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: i64,
    /// Always in `0..1_000_000_000`
    pub nanos: i32,
}

impl Timestamp {
    pub fn from_micros(micros: i64) -> Self {
        let seconds = micros.div_euclid(MICROS_PER_SECOND);
        let nanos = micros.rem_euclid(MICROS_PER_SECOND) * NANOS_PER_MICRO;
        Self { seconds, nanos: nanos as i32 }
    }

    pub fn as_micros(&self) -> i64 {
        self.seconds * MICROS_PER_SECOND + i64::from(self.nanos) / NANOS_PER_MICRO
    }

    /// RFC 3339 form with nanosecond precision, `None` when out of range
    pub fn to_rfc3339(&self) -> Option<String> {
        DateTime::<Utc>::from_timestamp(self.seconds, self.nanos as u32)
            .map(|time| time.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }
}

/// Value of a point. Exactly one slot is populated.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Int64(i64),
    Double(f64),
    Bool(bool),
    String(String),
}

impl TypedValue {
    pub fn int64_value(&self) -> Option<i64> {
        match self {
            TypedValue::Int64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn double_value(&self) -> Option<f64> {
        match self {
            TypedValue::Double(value) => Some(*value),
            _ => None,
        }
    }

    pub fn bool_value(&self) -> Option<bool> {
        match self {
            TypedValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn string_value(&self) -> Option<&str> {
        match self {
            TypedValue::String(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesPoint {
    pub end_time: Timestamp,
    pub value: TypedValue,
}

/// One labeled series carrying the points of one (device, field) pair
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub resource: ResourceIdentity,
    pub metric_type: String,
    pub metric_labels: BTreeMap<String, String>,
    pub points: Vec<TimeSeriesPoint>,
}

/// Series collected during one poll cycle
#[derive(Debug, Clone, Default)]
pub struct SubmissionBatch {
    series: Vec<TimeSeries>,
}

impl SubmissionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, series: TimeSeries) {
        self.series.push(series);
    }

    pub fn series(&self) -> &[TimeSeries] {
        &self.series
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_split() {
        let ts = Timestamp::from_micros(1_500_000);
        assert_eq!(ts.seconds, 1);
        assert_eq!(ts.nanos, 500_000_000);

        let ts = Timestamp::from_micros(3_000_000);
        assert_eq!((ts.seconds, ts.nanos), (3, 0));
    }

    #[test]
    fn test_timestamp_recombines() {
        for micros in [0, 1, 999_999, 1_000_000, 1_602_000_123_456_789, -1, -1_500_001] {
            let ts = Timestamp::from_micros(micros);
            assert!((0..1_000_000_000).contains(&ts.nanos));
            assert_eq!(ts.seconds * 1_000_000 + i64::from(ts.nanos) / 1_000, micros);
            assert_eq!(ts.as_micros(), micros);
        }
    }

    #[test]
    fn test_rfc3339() {
        let ts = Timestamp::from_micros(1_500_000);
        assert_eq!(ts.to_rfc3339().unwrap(), "1970-01-01T00:00:01.500000000Z");
    }

    #[test]
    fn test_typed_value_slots() {
        let value = TypedValue::Double(0.5);
        assert_eq!(value.double_value(), Some(0.5));
        assert!(value.int64_value().is_none());
        assert!(value.bool_value().is_none());
        assert!(value.string_value().is_none());
    }
}
