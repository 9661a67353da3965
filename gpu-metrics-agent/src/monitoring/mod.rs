//! Cloud Monitoring v3 REST client
//!
//! Provides:
//! - Metric descriptor creation, listing and deletion
//! - Time series creation (one request per batch)
//! - Bearer tokens from a static value or the GCE metadata server
//! - Bounded retry of throttled / unavailable responses

mod retry;
pub mod wire;

pub use retry::{Backoff, RetryPolicy};

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::{RequestBuilder, Response};
use tracing::debug;

use crate::catalog::MetricDefinition;
use crate::resource::GceMetadataClient;
use crate::series::SubmissionBatch;
use crate::sink::{MetricSink, SinkError};
use wire::{CreateTimeSeriesBody, ListDescriptorsResponse, MetricDescriptorBody};

pub const DEFAULT_MONITORING_ENDPOINT: &str = "https://monitoring.googleapis.com/v3/";

/// Metric types written by the agent live under this prefix
pub const CUSTOM_METRIC_DOMAIN: &str = "custom.googleapis.com/";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

enum Tokens {
    Fixed(String),
    Metadata {
        client: GceMetadataClient,
        cached: Mutex<Option<CachedToken>>,
    },
}

/// Where bearer tokens come from: a fixed token, or the instance's service
/// account through the metadata server (cached until shortly before expiry)
pub struct TokenSource {
    tokens: Tokens,
}

impl TokenSource {
    pub fn fixed(token: impl Into<String>) -> Self {
        Self { tokens: Tokens::Fixed(token.into()) }
    }

    pub fn metadata(client: GceMetadataClient) -> Self {
        Self { tokens: Tokens::Metadata { client, cached: Mutex::new(None) } }
    }

    async fn token(&self) -> Result<String, SinkError> {
        match &self.tokens {
            Tokens::Fixed(token) => Ok(token.clone()),
            Tokens::Metadata { client, cached } => {
                if let Some(token) = cached.lock().as_ref() {
                    if Instant::now() < token.expires_at {
                        return Ok(token.value.clone());
                    }
                }

                let fresh = client
                    .access_token()
                    .await
                    .map_err(|e| SinkError::Auth(e.to_string()))?;
                let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
                debug!("Fetched access token valid for {:?}", lifetime);

                *cached.lock() = Some(CachedToken {
                    value: fresh.access_token.clone(),
                    expires_at: Instant::now() + lifetime,
                });
                Ok(fresh.access_token)
            }
        }
    }
}

/// `MetricSink` backed by the Cloud Monitoring REST API
pub struct CloudMonitoringClient {
    http: reqwest::Client,
    endpoint: String,
    tokens: TokenSource,
    retry: RetryPolicy,
}

impl CloudMonitoringClient {
    pub fn new(endpoint: impl Into<String>, tokens: TokenSource, retry: RetryPolicy) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let mut endpoint = endpoint.into();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        Ok(Self { http, endpoint, tokens, retry })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// Send one request built by `build`, retrying transient failures.
    async fn send<F>(&self, what: &str, build: F) -> Result<Response, SinkError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let build = &build;
        self.retry
            .run(what, move || async move {
                let token = self.tokens.token().await?;
                let response = build(&self.http).bearer_auth(token).send().await?;
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let body = response.text().await.unwrap_or_default();
                Err(SinkError::from_status(status.as_u16(), wire::error_message(&body)))
            })
            .await
    }

    /// Names of the project's custom metric descriptors
    pub async fn list_descriptors(&self, project: &str) -> Result<Vec<String>, SinkError> {
        let url = self.url(&format!("{project}/metricDescriptors"));
        let filter = format!("metric.type = starts_with(\"{CUSTOM_METRIC_DOMAIN}\")");
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let response = self
                .send("list metric descriptors", |http| {
                    let mut request = http.get(&url).query(&[("filter", filter.as_str())]);
                    if let Some(token) = &page_token {
                        request = request.query(&[("pageToken", token.as_str())]);
                    }
                    request
                })
                .await?;
            let page: ListDescriptorsResponse = response.json().await?;
            names.extend(page.metric_descriptors.into_iter().map(|entry| entry.name));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(names)
    }

    pub async fn delete_descriptor(&self, project: &str, metric_type: &str) -> Result<(), SinkError> {
        let url = self.url(&format!("{project}/metricDescriptors/{metric_type}"));
        self.send("delete metric descriptor", |http| http.delete(&url)).await?;
        Ok(())
    }
}

impl MetricSink for CloudMonitoringClient {
    async fn create_descriptor(&self, project: &str, definition: &MetricDefinition) -> Result<(), SinkError> {
        let url = self.url(&format!("{project}/metricDescriptors"));
        let body = MetricDescriptorBody::from(definition);
        self.send("create metric descriptor", |http| http.post(&url).json(&body)).await?;
        Ok(())
    }

    async fn submit(&self, project: &str, batch: &SubmissionBatch) -> Result<(), SinkError> {
        let url = self.url(&format!("{project}/timeSeries"));
        let body = CreateTimeSeriesBody::encode(batch)?;
        self.send("create time series", |http| http.post(&url).json(&body)).await?;
        Ok(())
    }
}
