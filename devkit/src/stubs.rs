/*!
Stubs des ports de l'agent pour tests sans dcgmi ni Cloud Monitoring

- `MockFieldReader`: rejoue une liste de résultats de poll
- `MockSink`: enregistre descripteurs et batches, pannes programmables
- `StaticMetadata`: source de métadonnées en mémoire
*/

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use gpu_metrics_agent::catalog::MetricDefinition;
use gpu_metrics_agent::resource::{MetadataError, MetadataSource};
use gpu_metrics_agent::{FieldId, FieldReader, PollResult, ReaderError, SinkError, SubmissionBatch, WatchSession};

/// Paramètres reçus par `FieldReader::open`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub field_ids: Vec<FieldId>,
    pub group_name: String,
    pub update_frequency_us: u64,
}

#[derive(Debug, Default)]
struct ReaderState {
    script: VecDeque<Result<PollResult, String>>,
    opens: Vec<OpenRequest>,
    poll_times: Vec<Instant>,
    closes: usize,
}

/// Lecteur scripté: chaque poll consomme la prochaine entrée du script,
/// puis renvoie des polls vides une fois le script épuisé.
#[derive(Clone, Default)]
pub struct MockFieldReader {
    state: Arc<Mutex<ReaderState>>,
    poll_delay: Duration,
    fail_open: bool,
}

impl MockFieldReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute un poll réussi au script
    pub fn push_poll(&self, poll: PollResult) -> &Self {
        self.state.lock().script.push_back(Ok(poll));
        self
    }

    /// Ajoute un poll en échec au script
    pub fn push_failure(&self, message: &str) -> &Self {
        self.state.lock().script.push_back(Err(message.to_string()));
        self
    }

    /// Durée simulée de chaque poll
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    /// `open` échoue comme si dcgmi était absent
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn opens(&self) -> Vec<OpenRequest> {
        self.state.lock().opens.clone()
    }

    /// Instants (horloge tokio) de début de chaque poll
    pub fn poll_times(&self) -> Vec<Instant> {
        self.state.lock().poll_times.clone()
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().poll_times.len()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }
}

impl FieldReader for MockFieldReader {
    type Session = MockSession;

    async fn open(
        &self,
        field_ids: &[FieldId],
        group_name: &str,
        update_frequency_us: u64,
    ) -> Result<MockSession, ReaderError> {
        if self.fail_open {
            return Err(ReaderError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "mock reader refuses to open",
            )));
        }

        self.state.lock().opens.push(OpenRequest {
            field_ids: field_ids.to_vec(),
            group_name: group_name.to_string(),
            update_frequency_us,
        });
        log::info!("[MOCK] Watching {} fields in group {}", field_ids.len(), group_name);

        Ok(MockSession { state: Arc::clone(&self.state), poll_delay: self.poll_delay })
    }
}

pub struct MockSession {
    state: Arc<Mutex<ReaderState>>,
    poll_delay: Duration,
}

impl WatchSession for MockSession {
    async fn poll(&mut self) -> Result<PollResult, ReaderError> {
        let next = {
            let mut state = self.state.lock();
            state.poll_times.push(Instant::now());
            state.script.pop_front()
        };

        if !self.poll_delay.is_zero() {
            tokio::time::sleep(self.poll_delay).await;
        }

        match next {
            Some(Ok(poll)) => Ok(poll),
            Some(Err(message)) => Err(ReaderError::Parse(message)),
            None => Ok(PollResult::new()),
        }
    }

    async fn close(&mut self) -> Result<(), ReaderError> {
        self.state.lock().closes += 1;
        log::info!("[MOCK] Watch released");
        Ok(())
    }
}

/// Panne programmée d'un appel au sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFailure {
    /// Statut HTTP classé transitoire ou définitif par `SinkError::from_status`
    Status(u16),
    /// Échec après épuisement des tentatives
    Exhausted,
}

impl SinkFailure {
    fn into_error(self) -> SinkError {
        match self {
            SinkFailure::Status(status) => SinkError::from_status(status, format!("mock status {status}")),
            SinkFailure::Exhausted => SinkError::RetryExhausted {
                attempts: 3,
                last: Box::new(SinkError::from_status(503, "mock unavailable".to_string())),
            },
        }
    }
}

#[derive(Debug, Default)]
struct SinkState {
    descriptors: Vec<String>,
    batches: Vec<SubmissionBatch>,
    submit_attempts: usize,
    submit_failures: VecDeque<SinkFailure>,
    descriptor_failures: BTreeMap<String, SinkFailure>,
}

/// Sink en mémoire
#[derive(Clone, Default)]
pub struct MockSink {
    state: Arc<Mutex<SinkState>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Les prochains `submit` échouent dans l'ordre donné
    pub fn fail_next_submits(&self, failures: impl IntoIterator<Item = SinkFailure>) -> &Self {
        self.state.lock().submit_failures.extend(failures);
        self
    }

    /// La création du descripteur `metric_type` échoue
    pub fn fail_descriptor(&self, metric_type: &str, failure: SinkFailure) -> &Self {
        self.state.lock().descriptor_failures.insert(metric_type.to_string(), failure);
        self
    }

    /// Descripteurs créés avec succès, dans l'ordre
    pub fn descriptors(&self) -> Vec<String> {
        self.state.lock().descriptors.clone()
    }

    /// Batches acceptés, dans l'ordre
    pub fn batches(&self) -> Vec<SubmissionBatch> {
        self.state.lock().batches.clone()
    }

    pub fn submit_attempts(&self) -> usize {
        self.state.lock().submit_attempts
    }
}

impl gpu_metrics_agent::MetricSink for MockSink {
    async fn create_descriptor(&self, _project: &str, definition: &MetricDefinition) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if let Some(failure) = state.descriptor_failures.get(&definition.metric_name) {
            return Err(failure.into_error());
        }
        state.descriptors.push(definition.metric_name.clone());
        Ok(())
    }

    async fn submit(&self, _project: &str, batch: &SubmissionBatch) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        state.submit_attempts += 1;
        if let Some(failure) = state.submit_failures.pop_front() {
            log::warn!("[MOCK] Failing submission of {} series", batch.len());
            return Err(failure.into_error());
        }
        state.batches.push(batch.clone());
        Ok(())
    }
}

/// Métadonnées en mémoire, clés au format du serveur metadata GCE
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    values: BTreeMap<String, String>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance `1234567890` du projet `test-project` en `us-central1-a`
    pub fn gce_instance() -> Self {
        Self::new()
            .with("project/project-id", "test-project")
            .with("instance/id", "1234567890")
            .with("instance/zone", "projects/42/zones/us-central1-a")
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }
}

impl MetadataSource for StaticMetadata {
    async fn get(&self, key: &str) -> Result<String, MetadataError> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| MetadataError::Missing(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_metrics_agent::MetricSink;

    #[tokio::test]
    async fn test_mock_reader_replays_script() {
        let reader = MockFieldReader::new();
        reader.push_poll(PollResult::new()).push_failure("boom");

        let mut session = reader.open(&[203], "group", 10_000_000).await.unwrap();
        assert!(session.poll().await.unwrap().is_empty());
        assert!(matches!(session.poll().await, Err(ReaderError::Parse(m)) if m == "boom"));
        assert!(session.poll().await.unwrap().is_empty());
        session.close().await.unwrap();

        assert_eq!(reader.poll_count(), 3);
        assert_eq!(reader.close_count(), 1);
        assert_eq!(reader.opens()[0].update_frequency_us, 10_000_000);
    }

    #[tokio::test]
    async fn test_mock_sink_scripted_failures() {
        let sink = MockSink::new();
        sink.fail_next_submits([SinkFailure::Status(503)]);

        let batch = SubmissionBatch::new();
        assert!(matches!(sink.submit("projects/p", &batch).await, Err(SinkError::Transient { status: 503, .. })));
        assert!(sink.submit("projects/p", &batch).await.is_ok());
        assert_eq!(sink.submit_attempts(), 2);
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_static_metadata_missing_key() {
        let metadata = StaticMetadata::gce_instance();
        assert_eq!(metadata.get("instance/id").await.unwrap(), "1234567890");
        assert!(matches!(metadata.get("instance/name").await, Err(MetadataError::Missing(_))));
    }
}
