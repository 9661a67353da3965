//! Field sample -> time series translation
//!
//! Pure conversion with no I/O:
//! - unknown fields and blank samples yield nothing
//! - the microsecond timestamp becomes the point's end time
//! - the raw value lands in the slot selected by the metric's value type

use std::collections::BTreeMap;

use crate::catalog::{FieldId, MetricCatalog, ValueType};
use crate::fields::{DeviceIndex, FieldSample, FieldValue};
use crate::resource::ResourceIdentity;
use crate::series::{TimeSeries, TimeSeriesPoint, Timestamp, TypedValue};

/// Metric label carrying the device index
pub const DEVICE_LABEL: &str = "device";

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("Metric {metric} expects {expected} values, got a {found} reading")]
    ValueTypeMismatch {
        metric: String,
        expected: ValueType,
        found: &'static str,
    },
}

/// Metric labels identifying one device
pub fn device_labels(device: DeviceIndex) -> BTreeMap<String, String> {
    BTreeMap::from([(DEVICE_LABEL.to_string(), device.to_string())])
}

/// Put `value` in the slot for `value_type`.
///
/// Integer readings are widened for DOUBLE metrics; every other
/// combination that does not match exactly is rejected.
pub fn coerce(value_type: ValueType, value: &FieldValue) -> Result<TypedValue, &'static str> {
    match (value_type, value) {
        (ValueType::Int64, FieldValue::Int(v)) => Ok(TypedValue::Int64(*v)),
        (ValueType::Double, FieldValue::Double(v)) => Ok(TypedValue::Double(*v)),
        (ValueType::Double, FieldValue::Int(v)) => Ok(TypedValue::Double(*v as f64)),
        (ValueType::Bool, FieldValue::Bool(v)) => Ok(TypedValue::Bool(*v)),
        (ValueType::String, FieldValue::Str(v)) => Ok(TypedValue::String(v.clone())),
        (_, other) => Err(other.kind()),
    }
}

/// Converts samples into series for one catalog and resource
#[derive(Debug, Clone, Copy)]
pub struct Translator<'a> {
    catalog: &'a MetricCatalog,
    resource: &'a ResourceIdentity,
}

impl<'a> Translator<'a> {
    pub fn new(catalog: &'a MetricCatalog, resource: &'a ResourceIdentity) -> Self {
        Self { catalog, resource }
    }

    pub fn catalog(&self) -> &'a MetricCatalog {
        self.catalog
    }

    pub fn translate(
        &self,
        field_id: FieldId,
        sample: &FieldSample,
        metric_labels: &BTreeMap<String, String>,
    ) -> Result<Option<TimeSeries>, TranslateError> {
        let Some(definition) = self.catalog.lookup(field_id) else {
            return Ok(None);
        };
        if sample.is_blank {
            return Ok(None);
        }

        let value = coerce(definition.value_type, &sample.value).map_err(|found| {
            TranslateError::ValueTypeMismatch {
                metric: definition.metric_name.clone(),
                expected: definition.value_type,
                found,
            }
        })?;

        let point = TimeSeriesPoint {
            end_time: Timestamp::from_micros(sample.timestamp_us),
            value,
        };

        Ok(Some(TimeSeries {
            resource: self.resource.clone(),
            metric_type: definition.metric_name.clone(),
            metric_labels: metric_labels.clone(),
            points: vec![point],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MetricDefinition;
    use crate::resource::ResourceType;

    fn catalog() -> MetricCatalog {
        MetricCatalog::new(vec![
            MetricDefinition::gauge(1, "m_int", "int metric", ValueType::Int64, None),
            MetricDefinition::gauge(2, "m_double", "double metric", ValueType::Double, Some("W")),
            MetricDefinition::gauge(3, "m_bool", "bool metric", ValueType::Bool, None),
            MetricDefinition::gauge(4, "m_string", "string metric", ValueType::String, None),
        ])
        .unwrap()
    }

    fn resource() -> ResourceIdentity {
        ResourceIdentity::new(
            ResourceType::GceInstance,
            BTreeMap::from([("instance_id".to_string(), "i-1".to_string())]),
        )
    }

    #[test]
    fn test_unknown_field_is_skipped() {
        let (catalog, resource) = (catalog(), resource());
        let translator = Translator::new(&catalog, &resource);
        let sample = FieldSample::new(FieldValue::Int(1), 1_000_000);
        for field_id in [0, 5, 203, 1001] {
            assert!(translator.translate(field_id, &sample, &device_labels(0)).unwrap().is_none());
        }
    }

    #[test]
    fn test_blank_sample_is_skipped() {
        let (catalog, resource) = (catalog(), resource());
        let translator = Translator::new(&catalog, &resource);
        for field_id in 1..=4 {
            let sample = FieldSample::blank(1_000_000);
            assert!(translator.translate(field_id, &sample, &device_labels(0)).unwrap().is_none());
        }
    }

    #[test]
    fn test_int64_series() {
        let (catalog, resource) = (catalog(), resource());
        let translator = Translator::new(&catalog, &resource);
        let sample = FieldSample::new(FieldValue::Int(55), 3_000_000);

        let series = translator.translate(1, &sample, &device_labels(0)).unwrap().unwrap();
        assert_eq!(series.metric_type, "m_int");
        assert_eq!(series.metric_labels, device_labels(0));
        assert_eq!(series.metric_labels[DEVICE_LABEL], "0");
        assert_eq!(series.resource, resource);
        assert_eq!(series.points.len(), 1);

        let point = &series.points[0];
        assert_eq!(point.end_time, Timestamp { seconds: 3, nanos: 0 });
        assert_eq!(point.value.int64_value(), Some(55));
        assert!(point.value.double_value().is_none());
    }

    #[test]
    fn test_double_series_only_fills_double_slot() {
        let (catalog, resource) = (catalog(), resource());
        let translator = Translator::new(&catalog, &resource);

        for raw in [FieldValue::Double(87.5), FieldValue::Int(90)] {
            let sample = FieldSample::new(raw, 1_500_000);
            let series = translator.translate(2, &sample, &device_labels(1)).unwrap().unwrap();
            let value = &series.points[0].value;
            assert!(value.double_value().is_some());
            assert!(value.int64_value().is_none());
            assert!(value.bool_value().is_none());
            assert!(value.string_value().is_none());
            assert_eq!(series.points[0].end_time, Timestamp { seconds: 1, nanos: 500_000_000 });
        }
    }

    #[test]
    fn test_bool_and_string_series() {
        let (catalog, resource) = (catalog(), resource());
        let translator = Translator::new(&catalog, &resource);

        let sample = FieldSample::new(FieldValue::Bool(true), 0);
        let series = translator.translate(3, &sample, &device_labels(0)).unwrap().unwrap();
        assert_eq!(series.points[0].value, TypedValue::Bool(true));

        let sample = FieldSample::new(FieldValue::Str("P0".into()), 0);
        let series = translator.translate(4, &sample, &device_labels(0)).unwrap().unwrap();
        assert_eq!(series.points[0].value.string_value(), Some("P0"));
    }

    #[test]
    fn test_mismatch_is_rejected_not_truncated() {
        let (catalog, resource) = (catalog(), resource());
        let translator = Translator::new(&catalog, &resource);

        let cases = [
            (1, FieldValue::Double(12.9)),
            (1, FieldValue::Str("12".into())),
            (3, FieldValue::Int(1)),
            (4, FieldValue::Double(1.0)),
        ];
        for (field_id, raw) in cases {
            let sample = FieldSample::new(raw, 0);
            let err = translator.translate(field_id, &sample, &device_labels(0)).unwrap_err();
            assert!(matches!(err, TranslateError::ValueTypeMismatch { .. }));
        }
    }

    #[test]
    fn test_timestamp_round_trip() {
        let (catalog, resource) = (catalog(), resource());
        let translator = Translator::new(&catalog, &resource);

        for micros in [0_i64, 1, 999_999, 1_000_001, 1_603_000_000_123_456] {
            let sample = FieldSample::new(FieldValue::Int(1), micros);
            let series = translator.translate(1, &sample, &device_labels(0)).unwrap().unwrap();
            let end = series.points[0].end_time;
            assert_eq!(end.seconds * 1_000_000 + i64::from(end.nanos) / 1_000, micros);
        }
    }
}
