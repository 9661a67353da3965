//! Configuration management
//!
//! Handles:
//! - Built-in defaults
//! - Optional TOML file (explicit path, env var, or OS config dir)
//! - Command line overrides
//! - Validation into the settings the agent runs with

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::DEFAULT_METRIC_PREFIX;
use crate::monitoring::{RetryPolicy, DEFAULT_MONITORING_ENDPOINT};
use crate::resource::{ResourceType, DEFAULT_METADATA_ENDPOINT};

pub const CONFIG_ENV_VAR: &str = "GPU_METRICS_AGENT_CONFIG";
pub const MIN_UPDATE_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_FIELD_GROUP: &str = "dcgm_stackdriver";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("A project id is required (--project-id or monitoring.project_id)")]
    MissingProjectId,
    #[error("Update interval must be at least {min}s, got {secs}s")]
    IntervalTooShort { secs: u64, min: u64 },
    #[error("Unsupported resource type: {0}")]
    UnknownResourceType(String),
    #[error("Retry attempts must be at least 1")]
    InvalidRetry,
    #[error("Invalid resource label '{0}', expected key=value")]
    InvalidLabel(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub monitoring: MonitoringConfig,
    pub collection: CollectionConfig,
    pub resource: ResourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub project_id: Option<String>,
    pub endpoint: String,
    #[serde(skip_serializing)] // Never write tokens back to disk
    pub access_token: Option<String>,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub update_interval_secs: u64,
    pub field_group: String,
    pub metric_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub labels: Option<BTreeMap<String, String>>,
    pub metadata_endpoint: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            endpoint: DEFAULT_MONITORING_ENDPOINT.to_string(),
            access_token: None,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: MIN_UPDATE_INTERVAL_SECS,
            field_group: DEFAULT_FIELD_GROUP.to_string(),
            metric_prefix: DEFAULT_METRIC_PREFIX.to_string(),
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            resource_type: ResourceType::GceInstance.as_str().to_string(),
            labels: None,
            metadata_endpoint: DEFAULT_METADATA_ENDPOINT.to_string(),
        }
    }
}

/// Values given on the command line, applied over the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub project_id: Option<String>,
    pub update_interval_secs: Option<u64>,
    pub resource_type: Option<String>,
    pub resource_labels: Vec<(String, String)>,
    pub access_token: Option<String>,
}

/// Validated settings the agent runs with
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_id: String,
    pub update_interval: Duration,
    pub field_group: String,
    pub metric_prefix: String,
    pub resource_type: ResourceType,
    pub resource_labels: Option<BTreeMap<String, String>>,
    pub monitoring_endpoint: String,
    pub metadata_endpoint: String,
    pub access_token: Option<String>,
    pub retry: RetryPolicy,
}

/// Parse a `key=value` resource label
pub fn parse_label(raw: &str) -> Result<(String, String), ConfigError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
        _ => Err(ConfigError::InvalidLabel(raw.to_string())),
    }
}

impl AgentConfig {
    /// Load the config file, falling back to defaults when none exists.
    ///
    /// An explicitly given path must exist.
    pub async fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => match std::env::var_os(CONFIG_ENV_VAR) {
                Some(path) => Some(PathBuf::from(path)),
                None => Self::config_file_path().filter(|path| path.exists()),
            },
        };

        let Some(path) = path else {
            debug!("No config file, using defaults");
            return Ok(Self::default());
        };

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        let config: AgentConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// OS-specific config file location
    pub fn config_file_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("gpu-metrics-agent");
        path.push("config.toml");
        Some(path)
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(project_id) = overrides.project_id {
            self.monitoring.project_id = Some(project_id);
        }
        if let Some(secs) = overrides.update_interval_secs {
            self.collection.update_interval_secs = secs;
        }
        if let Some(resource_type) = overrides.resource_type {
            self.resource.resource_type = resource_type;
        }
        if !overrides.resource_labels.is_empty() {
            self.resource.labels = Some(overrides.resource_labels.into_iter().collect());
        }
        if let Some(token) = overrides.access_token {
            self.monitoring.access_token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let project_id = self
            .monitoring
            .project_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::MissingProjectId)?;

        let secs = self.collection.update_interval_secs;
        if secs < MIN_UPDATE_INTERVAL_SECS {
            return Err(ConfigError::IntervalTooShort { secs, min: MIN_UPDATE_INTERVAL_SECS });
        }

        let resource_type = self
            .resource
            .resource_type
            .parse::<ResourceType>()
            .map_err(ConfigError::UnknownResourceType)?;

        let retry = &self.monitoring.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::InvalidRetry);
        }

        Ok(Settings {
            project_id: project_id.to_string(),
            update_interval: Duration::from_secs(secs),
            field_group: self.collection.field_group.clone(),
            metric_prefix: self.collection.metric_prefix.clone(),
            resource_type,
            resource_labels: self.resource.labels.clone(),
            monitoring_endpoint: self.monitoring.endpoint.clone(),
            metadata_endpoint: self.resource.metadata_endpoint.clone(),
            access_token: self.monitoring.access_token.clone().filter(|t| !t.is_empty()),
            retry: RetryPolicy {
                max_attempts: retry.max_attempts,
                initial_backoff: Duration::from_millis(retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(retry.max_backoff_ms),
            },
        })
    }
}
