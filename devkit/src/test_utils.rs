/*!
Fixtures et harness de test pour l'agent

Le harness assemble la boucle complète (traduction, batch, export) autour
d'un lecteur scripté et d'un sink en mémoire.
*/

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use gpu_metrics_agent::catalog::DCGM_FI_DEV_GPU_UTIL;
use gpu_metrics_agent::resource::ResourceType;
use gpu_metrics_agent::sink::project_path;
use gpu_metrics_agent::{
    BatchBuilder, DeviceIndex, Exporter, FieldId, FieldSample, FieldValue, LoopReport, MetricCatalog,
    MetricDefinition, PollLoop, PollResult, ReaderError, ResourceIdentity, Translator, ValueType,
};

use crate::stubs::{MockFieldReader, MockSink};

pub const TEST_PROJECT_ID: &str = "test-project";
pub const TEST_GROUP: &str = "dcgm_stackdriver";

/// F1 -> `custom.googleapis.com/m1` (INT64)
pub fn single_field_catalog() -> MetricCatalog {
    catalog_of(&[(DCGM_FI_DEV_GPU_UTIL, "custom.googleapis.com/m1", ValueType::Int64)])
}

pub fn catalog_of(entries: &[(FieldId, &str, ValueType)]) -> MetricCatalog {
    let definitions = entries
        .iter()
        .map(|(field_id, name, value_type)| {
            MetricDefinition::gauge(*field_id, *name, format!("Test metric {name}"), *value_type, None)
        })
        .collect();
    // Les fixtures n'ont jamais de doublons
    MetricCatalog::new(definitions).unwrap()
}

pub fn gce_identity() -> ResourceIdentity {
    ResourceIdentity::new(
        ResourceType::GceInstance,
        BTreeMap::from([
            ("instance_id".to_string(), "1234567890".to_string()),
            ("project_id".to_string(), TEST_PROJECT_ID.to_string()),
            ("zone".to_string(), "us-central1-a".to_string()),
        ]),
    )
}

/// Échantillon horodaté à `seconds` secondes
pub fn sample_at(value: FieldValue, seconds: i64) -> FieldSample {
    FieldSample::new(value, seconds * 1_000_000)
}

/// Poll d'un seul échantillon par (device, field)
pub fn poll_of(entries: &[(DeviceIndex, FieldId, FieldSample)]) -> PollResult {
    let mut poll = PollResult::new();
    for (device, field_id, sample) in entries {
        poll.entry(*device).or_default().entry(*field_id).or_default().push(sample.clone());
    }
    poll
}

/// Harness de la boucle de collecte
pub struct TestHarness {
    pub catalog: MetricCatalog,
    pub identity: ResourceIdentity,
    pub reader: MockFieldReader,
    pub sink: MockSink,
    pub interval: Duration,
}

impl TestHarness {
    pub fn new(catalog: MetricCatalog) -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        Self {
            catalog,
            identity: gce_identity(),
            reader: MockFieldReader::new(),
            sink: MockSink::new(),
            interval: Duration::from_secs(10),
        }
    }

    pub fn with_reader(mut self, reader: MockFieldReader) -> Self {
        self.reader = reader;
        self
    }

    /// Fait tourner la boucle jusqu'à `shutdown`
    pub async fn run_until<F>(&self, shutdown: F) -> Result<LoopReport, ReaderError>
    where
        F: Future<Output = ()>,
    {
        let builder = BatchBuilder::new(Translator::new(&self.catalog, &self.identity));
        let exporter = Exporter::new(&self.sink, project_path(TEST_PROJECT_ID));
        PollLoop::new(builder, exporter, self.interval)
            .run(&self.reader, TEST_GROUP, shutdown)
            .await
    }

    /// Fait tourner exactement `cycles` cycles (horloge tokio en pause)
    pub async fn run_cycles(&self, cycles: u32) -> Result<LoopReport, ReaderError> {
        // Arrêt entre le dernier cycle et le suivant
        let stop_after = self.interval * cycles.saturating_sub(1) + self.interval / 2;
        self.run_until(tokio::time::sleep(stop_after)).await
    }

    /// Séries soumises au sink, à plat
    pub fn submitted_series(&self) -> Vec<gpu_metrics_agent::TimeSeries> {
        self.sink
            .batches()
            .iter()
            .flat_map(|batch| batch.series().to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures() {
        let catalog = single_field_catalog();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.lookup(DCGM_FI_DEV_GPU_UTIL).unwrap().value_type, ValueType::Int64);

        let poll = poll_of(&[(0, DCGM_FI_DEV_GPU_UTIL, sample_at(FieldValue::Int(55), 3))]);
        assert_eq!(poll[&0][&DCGM_FI_DEV_GPU_UTIL][0].timestamp_us, 3_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_harness_runs_requested_cycles() {
        let harness = TestHarness::new(single_field_catalog());
        let report = harness.run_cycles(3).await.unwrap();
        assert_eq!(report.cycles, 3);
        assert_eq!(harness.reader.close_count(), 1);
    }
}
