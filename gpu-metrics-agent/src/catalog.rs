//! Metric catalog: which DCGM fields are watched and how they are published
//!
//! Each watched field id maps to exactly one Cloud Monitoring metric:
//! - metric type (name), kind and value type
//! - unit and description used when the descriptor is registered
//!
//! The table is built once at startup and never changes afterwards.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a field in the DCGM field namespace
pub type FieldId = u16;

/// Default prefix for the custom metric types written by the agent
pub const DEFAULT_METRIC_PREFIX: &str = "custom.googleapis.com/gce/gpu-test/";

// DCGM field identifiers (dcgm_fields.h)
pub const DCGM_FI_DEV_POWER_USAGE: FieldId = 155;
pub const DCGM_FI_DEV_GPU_UTIL: FieldId = 203;
pub const DCGM_FI_DEV_FB_USED: FieldId = 252;
pub const DCGM_FI_PROF_GR_ENGINE_ACTIVE: FieldId = 1001;
pub const DCGM_FI_PROF_SM_ACTIVE: FieldId = 1002;
pub const DCGM_FI_PROF_SM_OCCUPANCY: FieldId = 1003;
pub const DCGM_FI_PROF_PIPE_TENSOR_ACTIVE: FieldId = 1004;
pub const DCGM_FI_PROF_DRAM_ACTIVE: FieldId = 1005;
pub const DCGM_FI_PROF_PIPE_FP32_ACTIVE: FieldId = 1007;
pub const DCGM_FI_PROF_PCIE_TX_BYTES: FieldId = 1009;
pub const DCGM_FI_PROF_PCIE_RX_BYTES: FieldId = 1010;
pub const DCGM_FI_PROF_NVLINK_TX_BYTES: FieldId = 1011;
pub const DCGM_FI_PROF_NVLINK_RX_BYTES: FieldId = 1012;

/// Metric kind. Every published field is a gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    Gauge,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "GAUGE",
        }
    }
}

/// Value type of the points written for a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Int64,
    Double,
    Bool,
    String,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Int64 => "INT64",
            ValueType::Double => "DOUBLE",
            ValueType::Bool => "BOOL",
            ValueType::String => "STRING",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Definition of one published metric
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    pub field_id: FieldId,
    pub metric_name: String,
    pub description: String,
    pub kind: MetricKind,
    pub value_type: ValueType,
    pub unit: Option<String>,
}

impl MetricDefinition {
    pub fn gauge(
        field_id: FieldId,
        metric_name: impl Into<String>,
        description: impl Into<String>,
        value_type: ValueType,
        unit: Option<&str>,
    ) -> Self {
        Self {
            field_id,
            metric_name: metric_name.into(),
            description: description.into(),
            kind: MetricKind::Gauge,
            value_type,
            unit: unit.map(str::to_string),
        }
    }
}

/// Errors raised while building a catalog
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Field {0} is declared more than once")]
    DuplicateField(FieldId),
    #[error("Metric {0} is declared more than once")]
    DuplicateMetric(String),
}

/// Ordered, read-only mapping from field id to metric definition
#[derive(Debug, Clone)]
pub struct MetricCatalog {
    entries: Vec<MetricDefinition>,
}

impl MetricCatalog {
    /// Build a catalog, keeping declaration order for registration.
    pub fn new(entries: Vec<MetricDefinition>) -> Result<Self, CatalogError> {
        {
            let mut fields = HashSet::new();
            let mut names = HashSet::new();

            for entry in &entries {
                if !fields.insert(entry.field_id) {
                    return Err(CatalogError::DuplicateField(entry.field_id));
                }
                if !names.insert(entry.metric_name.as_str()) {
                    return Err(CatalogError::DuplicateMetric(entry.metric_name.clone()));
                }
            }
        }

        Ok(Self { entries })
    }

    /// The DCGM fields published by default: nvidia-smi equivalents
    /// followed by the profiling counters recommended by NVIDIA.
    pub fn dcgm_default(prefix: &str) -> Self {
        let metric = |suffix: &str| format!("{prefix}{suffix}");

        let entries = vec![
            MetricDefinition::gauge(DCGM_FI_DEV_GPU_UTIL, metric("utilization"), "GPU utilization", ValueType::Int64, Some("%")),
            MetricDefinition::gauge(DCGM_FI_DEV_FB_USED, metric("mem_used"), "GPU memory used", ValueType::Int64, Some("MBy")),
            MetricDefinition::gauge(DCGM_FI_DEV_POWER_USAGE, metric("power_usage"), "Power usage", ValueType::Double, Some("W")),
            MetricDefinition::gauge(DCGM_FI_PROF_GR_ENGINE_ACTIVE, metric("gr_engine_active"), "Ratio of time the graphics engine is active", ValueType::Double, Some("1")),
            MetricDefinition::gauge(DCGM_FI_PROF_SM_ACTIVE, metric("sm_active"), "Ratio of cycles an SM has at least 1 warp assigned", ValueType::Double, Some("1")),
            MetricDefinition::gauge(DCGM_FI_PROF_SM_OCCUPANCY, metric("sm_occupancy"), "Ratio of number of warps resident on an SM", ValueType::Double, Some("1")),
            MetricDefinition::gauge(DCGM_FI_PROF_DRAM_ACTIVE, metric("memory_active"), "Ratio of cycles the device memory interface is active sending or receiving data", ValueType::Double, Some("1")),
            MetricDefinition::gauge(DCGM_FI_PROF_PIPE_TENSOR_ACTIVE, metric("tensor_active"), "Ratio of cycles the tensor cores are active", ValueType::Double, Some("1")),
            MetricDefinition::gauge(DCGM_FI_PROF_PIPE_FP32_ACTIVE, metric("fp32_active"), "Ratio of cycles the FP32 cores are active", ValueType::Double, Some("1")),
            MetricDefinition::gauge(DCGM_FI_PROF_PCIE_TX_BYTES, metric("pcie_tx_throughput"), "PCIe transmit throughput", ValueType::Int64, None),
            MetricDefinition::gauge(DCGM_FI_PROF_PCIE_RX_BYTES, metric("pcie_rx_throughput"), "PCIe receive throughput", ValueType::Int64, None),
            MetricDefinition::gauge(DCGM_FI_PROF_NVLINK_TX_BYTES, metric("nvlink_tx_throughput"), "NVLink transmit throughput", ValueType::Int64, None),
            MetricDefinition::gauge(DCGM_FI_PROF_NVLINK_RX_BYTES, metric("nvlink_rx_throughput"), "NVLink receive throughput", ValueType::Int64, None),
        ];

        Self { entries }
    }

    pub fn lookup(&self, field_id: FieldId) -> Option<&MetricDefinition> {
        self.entries.iter().find(|entry| entry.field_id == field_id)
    }

    /// Definitions in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.entries.iter()
    }

    /// Field ids to watch, in declaration order
    pub fn field_ids(&self) -> Vec<FieldId> {
        self.entries.iter().map(|entry| entry.field_id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
