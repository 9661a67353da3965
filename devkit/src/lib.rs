/*!
# GPU Metrics DevKit - stubs et utilitaires de test

Bibliothèque facilitant le test de l'agent sans GPU ni projet cloud:
- Lecteur de champs DCGM scripté
- Sink de métriques en mémoire avec pannes programmables
- Serveur metadata / Cloud Monitoring factice (axum)
- Fixtures et harness pour la boucle complète
*/

pub mod fake_server;
pub mod stubs;
pub mod test_utils;

pub use fake_server::{FakeCloud, RecordedRequest};
pub use stubs::{MockFieldReader, MockSink, OpenRequest, SinkFailure, StaticMetadata};
pub use test_utils::TestHarness;
