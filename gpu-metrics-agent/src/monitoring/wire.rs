//! JSON bodies of the Cloud Monitoring v3 REST API

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, Serializer};

use crate::catalog::MetricDefinition;
use crate::series::{SubmissionBatch, TimeSeries, TypedValue};
use crate::sink::SinkError;
use crate::translator::DEVICE_LABEL;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptorBody<'a> {
    #[serde(rename = "type")]
    pub metric_type: &'a str,
    pub metric_kind: &'static str,
    pub value_type: &'static str,
    pub description: &'a str,
    pub display_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'a str>,
    pub labels: Vec<LabelDescriptor>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDescriptor {
    pub key: &'static str,
    pub value_type: &'static str,
    pub description: &'static str,
}

impl<'a> From<&'a MetricDefinition> for MetricDescriptorBody<'a> {
    fn from(definition: &'a MetricDefinition) -> Self {
        Self {
            metric_type: &definition.metric_name,
            metric_kind: definition.kind.as_str(),
            value_type: definition.value_type.as_str(),
            description: &definition.description,
            // `custom.googleapis.com/gce/gpu-test/utilization` -> `utilization`
            display_name: definition.metric_name.rsplit('/').next().unwrap_or(&definition.metric_name),
            unit: definition.unit.as_deref(),
            labels: vec![LabelDescriptor {
                key: DEVICE_LABEL,
                value_type: "STRING",
                description: "GPU index",
            }],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTimeSeriesBody<'a> {
    pub time_series: Vec<WireTimeSeries<'a>>,
}

#[derive(Debug, Serialize)]
pub struct WireTimeSeries<'a> {
    pub resource: WireLabeled<'a>,
    pub metric: WireLabeled<'a>,
    pub points: Vec<WirePoint<'a>>,
}

/// `{type, labels}` pair used for both the resource and the metric
#[derive(Debug, Serialize)]
pub struct WireLabeled<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub labels: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct WirePoint<'a> {
    pub interval: WireInterval,
    pub value: WireValue<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireInterval {
    pub end_time: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WireValue<'a> {
    // int64 travels as a JSON string
    #[serde(serialize_with = "int64_as_string")]
    Int64Value(i64),
    DoubleValue(f64),
    BoolValue(bool),
    StringValue(&'a str),
}

fn int64_as_string<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl<'a> From<&'a TypedValue> for WireValue<'a> {
    fn from(value: &'a TypedValue) -> Self {
        match value {
            TypedValue::Int64(v) => WireValue::Int64Value(*v),
            TypedValue::Double(v) => WireValue::DoubleValue(*v),
            TypedValue::Bool(v) => WireValue::BoolValue(*v),
            TypedValue::String(v) => WireValue::StringValue(v),
        }
    }
}

impl<'a> WireTimeSeries<'a> {
    fn encode(series: &'a TimeSeries, resource_type: &'a str) -> Result<Self, SinkError> {
        let points = series
            .points
            .iter()
            .map(|point| {
                let end_time = point.end_time.to_rfc3339().ok_or_else(|| {
                    SinkError::Encode(format!("timestamp out of range: {:?}", point.end_time))
                })?;
                Ok(WirePoint {
                    interval: WireInterval { end_time },
                    value: WireValue::from(&point.value),
                })
            })
            .collect::<Result<Vec<_>, SinkError>>()?;

        Ok(Self {
            resource: WireLabeled { kind: resource_type, labels: series.resource.labels() },
            metric: WireLabeled { kind: &series.metric_type, labels: &series.metric_labels },
            points,
        })
    }
}

impl<'a> CreateTimeSeriesBody<'a> {
    pub fn encode(batch: &'a SubmissionBatch) -> Result<Self, SinkError> {
        let time_series = batch
            .series()
            .iter()
            .map(|series| WireTimeSeries::encode(series, series.resource.resource_type().as_str()))
            .collect::<Result<Vec<_>, SinkError>>()?;
        Ok(Self { time_series })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDescriptorsResponse {
    #[serde(default)]
    pub metric_descriptors: Vec<DescriptorEntry>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DescriptorEntry {
    pub name: String,
    #[serde(rename = "type", default)]
    pub metric_type: String,
}

/// Google API error envelope: `{"error": {"code", "message", "status"}}`
#[derive(Debug, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}

/// Best-effort human readable message of an error response body
pub fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) if !envelope.error.status.is_empty() => {
            format!("{}: {}", envelope.error.status, envelope.error.message)
        }
        Ok(envelope) => envelope.error.message,
        Err(_) => body.trim().to_string(),
    }
}
