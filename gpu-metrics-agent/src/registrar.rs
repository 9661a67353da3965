//! Startup registration of the catalog's metric descriptors

use tracing::{debug, info};

use crate::catalog::MetricCatalog;
use crate::sink::{MetricSink, SinkError};

#[derive(Debug, thiserror::Error)]
#[error("Failed to register metric descriptor {metric}: {source}")]
pub struct RegistrationError {
    pub metric: String,
    #[source]
    pub source: SinkError,
}

/// Create every descriptor of `catalog`, in catalog order.
///
/// Stops at the first failure; the agent must not start polling when a
/// metric type could be left undefined.
pub async fn ensure_registered<S: MetricSink>(
    sink: &S,
    project: &str,
    catalog: &MetricCatalog,
) -> Result<usize, RegistrationError> {
    for definition in catalog.iter() {
        debug!("Registering descriptor {}", definition.metric_name);
        sink.create_descriptor(project, definition)
            .await
            .map_err(|source| RegistrationError {
                metric: definition.metric_name.clone(),
                source,
            })?;
    }

    info!("Registered {} metric descriptors in {}", catalog.len(), project);
    Ok(catalog.len())
}
