//! Monitored resource identity attached to every emitted series
//!
//! Handles:
//! - Resource type selection (only GCE instances are supported)
//! - Label lookup through the GCE metadata server
//! - Operator supplied labels that bypass the lookup

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

pub const DEFAULT_METADATA_ENDPOINT: &str = "http://metadata.google.internal/computeMetadata/v1/";

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR: &str = "Google";
const TOKEN_KEY: &str = "instance/service-accounts/default/token";

/// Monitored resource types known to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    GceInstance,
    Global,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::GceInstance => "gce_instance",
            ResourceType::Global => "global",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gce_instance" => Ok(ResourceType::GceInstance),
            "global" => Ok(ResourceType::Global),
            other => Err(other.to_string()),
        }
    }
}

/// Resource type and labels, fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceIdentity {
    resource_type: ResourceType,
    labels: BTreeMap<String, String>,
}

impl ResourceIdentity {
    pub fn new(resource_type: ResourceType, labels: BTreeMap<String, String>) -> Self {
        Self { resource_type, labels }
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Metadata request for {key} failed: {source}")]
    Http {
        key: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Metadata server answered {status} for {key}")]
    Status { key: String, status: u16 },
    #[error("Metadata value for {0} is empty")]
    Empty(String),
    #[error("Metadata key {0} is not available")]
    Missing(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Unsupported resource type: {0}")]
    Unsupported(ResourceType),
    #[error("Failed to resolve resource label {label}: {source}")]
    Metadata {
        label: &'static str,
        #[source]
        source: MetadataError,
    },
    #[error("Resource labels must not be empty")]
    EmptyLabels,
}

/// Key-value lookup of host metadata
#[allow(async_fn_in_trait)]
pub trait MetadataSource {
    async fn get(&self, key: &str) -> Result<String, MetadataError>;
}

/// One resource label and where its value comes from
struct LabelSpec {
    label: &'static str,
    metadata_key: &'static str,
    transform: Option<fn(&str) -> String>,
}

/// `projects/123/zones/us-central1-a` -> `us-central1-a`
fn last_path_segment(value: &str) -> String {
    value.rsplit('/').next().unwrap_or(value).to_string()
}

const GCE_INSTANCE_LABELS: &[LabelSpec] = &[
    LabelSpec { label: "project_id", metadata_key: "project/project-id", transform: None },
    LabelSpec { label: "instance_id", metadata_key: "instance/id", transform: None },
    LabelSpec { label: "zone", metadata_key: "instance/zone", transform: Some(last_path_segment) },
];

/// Resolve the resource identity for `resource_type`.
///
/// Labels in `overrides` are used verbatim and no lookup is made.
pub async fn resolve<M: MetadataSource>(
    resource_type: ResourceType,
    source: &M,
    overrides: Option<&BTreeMap<String, String>>,
) -> Result<ResourceIdentity, ResourceError> {
    if resource_type != ResourceType::GceInstance {
        return Err(ResourceError::Unsupported(resource_type));
    }

    if let Some(labels) = overrides {
        if labels.is_empty() {
            return Err(ResourceError::EmptyLabels);
        }
        info!("Using configured resource labels: {:?}", labels);
        return Ok(ResourceIdentity::new(resource_type, labels.clone()));
    }

    let mut labels = BTreeMap::new();
    for spec in GCE_INSTANCE_LABELS {
        let raw = source
            .get(spec.metadata_key)
            .await
            .map_err(|source| ResourceError::Metadata { label: spec.label, source })?;
        let raw = raw.trim();
        let value = match spec.transform {
            Some(transform) => transform(raw),
            None => raw.to_string(),
        };
        debug!("Resource label {} = {}", spec.label, value);
        labels.insert(spec.label.to_string(), value);
    }

    info!("Resolved {} resource labels: {:?}", resource_type, labels);
    Ok(ResourceIdentity::new(resource_type, labels))
}

/// OAuth access token handed out by the metadata server
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: String,
}

/// Client for the GCE metadata server
#[derive(Debug, Clone)]
pub struct GceMetadataClient {
    http: reqwest::Client,
    base_url: String,
}

impl GceMetadataClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self { http, base_url })
    }

    async fn fetch(&self, key: &str) -> Result<reqwest::Response, MetadataError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, key))
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR)
            .send()
            .await
            .map_err(|source| MetadataError::Http { key: key.to_string(), source })?;

        if !response.status().is_success() {
            return Err(MetadataError::Status {
                key: key.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    /// Access token of the instance's default service account
    pub async fn access_token(&self) -> Result<AccessToken, MetadataError> {
        self.fetch(TOKEN_KEY)
            .await?
            .json::<AccessToken>()
            .await
            .map_err(|source| MetadataError::Http { key: TOKEN_KEY.to_string(), source })
    }
}

impl MetadataSource for GceMetadataClient {
    async fn get(&self, key: &str) -> Result<String, MetadataError> {
        let text = self
            .fetch(key)
            .await?
            .text()
            .await
            .map_err(|source| MetadataError::Http { key: key.to_string(), source })?;

        if text.trim().is_empty() {
            return Err(MetadataError::Empty(key.to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedMetadata(HashMap<&'static str, &'static str>);

    impl MetadataSource for FixedMetadata {
        async fn get(&self, key: &str) -> Result<String, MetadataError> {
            self.0
                .get(key)
                .map(|value| value.to_string())
                .ok_or_else(|| MetadataError::Missing(key.to_string()))
        }
    }

    fn gce_metadata() -> FixedMetadata {
        FixedMetadata(HashMap::from([
            ("project/project-id", "my-project"),
            ("instance/id", "1234567890\n"),
            ("instance/zone", "projects/42/zones/us-central1-a"),
        ]))
    }

    #[tokio::test]
    async fn test_resolve_gce_instance() {
        let identity = resolve(ResourceType::GceInstance, &gce_metadata(), None).await.unwrap();
        assert_eq!(identity.resource_type(), ResourceType::GceInstance);
        assert_eq!(identity.labels()["project_id"], "my-project");
        assert_eq!(identity.labels()["instance_id"], "1234567890");
        assert_eq!(identity.labels()["zone"], "us-central1-a");
    }

    #[tokio::test]
    async fn test_unsupported_resource_type() {
        let result = resolve(ResourceType::Global, &gce_metadata(), None).await;
        assert!(matches!(result, Err(ResourceError::Unsupported(ResourceType::Global))));
    }

    #[tokio::test]
    async fn test_overrides_skip_lookup() {
        let empty = FixedMetadata(HashMap::new());
        let overrides = BTreeMap::from([("instance_id".to_string(), "abc".to_string())]);
        let identity = resolve(ResourceType::GceInstance, &empty, Some(&overrides)).await.unwrap();
        assert_eq!(identity.labels(), &overrides);

        let result = resolve(ResourceType::GceInstance, &empty, Some(&BTreeMap::new())).await;
        assert!(matches!(result, Err(ResourceError::EmptyLabels)));
    }

    #[tokio::test]
    async fn test_missing_metadata_names_label() {
        let partial = FixedMetadata(HashMap::from([("project/project-id", "p")]));
        let err = resolve(ResourceType::GceInstance, &partial, None).await.unwrap_err();
        assert!(matches!(err, ResourceError::Metadata { label: "instance_id", .. }));
    }

    #[test]
    fn test_resource_type_parse() {
        assert_eq!("gce_instance".parse::<ResourceType>(), Ok(ResourceType::GceInstance));
        assert_eq!("global".parse::<ResourceType>(), Ok(ResourceType::Global));
        assert_eq!("k8s_node".parse::<ResourceType>(), Err("k8s_node".to_string()));
    }
}
