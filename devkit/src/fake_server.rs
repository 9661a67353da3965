/*!
Serveur HTTP factice: metadata GCE + Cloud Monitoring v3

Tourne sur 127.0.0.1 (port éphémère) dans la runtime du test. Enregistre
chaque requête Cloud Monitoring et peut renvoyer des statuts d'erreur
programmés pour tester le retry.
*/

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const FAKE_TOKEN: &str = "fake-access-token";
const TOKEN_KEY: &str = "instance/service-accounts/default/token";

/// Requête Cloud Monitoring reçue
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub authorization: Option<String>,
    pub body: Option<Value>,
}

#[derive(Default)]
struct CloudState {
    requests: Vec<RecordedRequest>,
    scripted_statuses: VecDeque<u16>,
    descriptor_pages: Vec<Vec<String>>,
    metadata: BTreeMap<String, String>,
    token_fetches: usize,
}

type Shared = Arc<Mutex<CloudState>>;

pub struct FakeCloud {
    addr: SocketAddr,
    state: Shared,
    server: JoinHandle<()>,
}

impl FakeCloud {
    /// Démarre le serveur avec les métadonnées d'une instance de test
    pub async fn start() -> Result<Self> {
        let state: Shared = Arc::new(Mutex::new(CloudState::default()));
        {
            let mut guard = state.lock();
            guard.metadata.insert("project/project-id".into(), "test-project".into());
            guard.metadata.insert("instance/id".into(), "1234567890".into());
            guard.metadata.insert("instance/zone".into(), "projects/42/zones/us-central1-a".into());
        }

        let app = Router::new()
            .route("/computeMetadata/v1/{*key}", get(metadata))
            .fallback(monitoring)
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("Fake cloud server stopped: {}", e);
            }
        });

        log::info!("🧪 Fake cloud listening on {}", addr);
        Ok(Self { addr, state, server })
    }

    /// Base URL à passer à `CloudMonitoringClient::new`
    pub fn monitoring_endpoint(&self) -> String {
        format!("http://{}/v3/", self.addr)
    }

    /// Base URL à passer à `GceMetadataClient::new`
    pub fn metadata_endpoint(&self) -> String {
        format!("http://{}/computeMetadata/v1/", self.addr)
    }

    /// Les prochaines réponses Cloud Monitoring portent ces statuts
    pub fn respond_with(&self, statuses: impl IntoIterator<Item = u16>) {
        self.state.lock().scripted_statuses.extend(statuses);
    }

    /// Pages renvoyées par la liste des descripteurs
    pub fn set_descriptor_pages(&self, pages: Vec<Vec<String>>) {
        self.state.lock().descriptor_pages = pages;
    }

    pub fn set_metadata(&self, key: &str, value: &str) {
        self.state.lock().metadata.insert(key.to_string(), value.to_string());
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn token_fetches(&self) -> usize {
        self.state.lock().token_fetches
    }
}

impl Drop for FakeCloud {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn metadata(State(state): State<Shared>, Path(key): Path<String>, headers: HeaderMap) -> Response {
    if headers.get("Metadata-Flavor").and_then(|v| v.to_str().ok()) != Some("Google") {
        return StatusCode::FORBIDDEN.into_response();
    }

    let mut state = state.lock();
    if key == TOKEN_KEY {
        state.token_fetches += 1;
        return Json(json!({
            "access_token": FAKE_TOKEN,
            "expires_in": 3599,
            "token_type": "Bearer"
        }))
        .into_response();
    }

    match state.metadata.get(&key) {
        Some(value) => value.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn error_body(status: StatusCode) -> Response {
    let body = json!({
        "error": {
            "code": status.as_u16(),
            "message": "scripted failure",
            "status": status.canonical_reason().unwrap_or("UNKNOWN"),
        }
    });
    (status, Json(body)).into_response()
}

async fn monitoring(
    State(state): State<Shared>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let path = uri.path().to_string();
    let mut state = state.lock();

    state.requests.push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        query: query.clone(),
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_str(&body).ok(),
    });

    if let Some(status) = state.scripted_statuses.pop_front() {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return error_body(status);
    }

    if method == Method::POST && (path.ends_with("/metricDescriptors") || path.ends_with("/timeSeries")) {
        return Json(serde_json::from_str::<Value>(&body).unwrap_or(json!({}))).into_response();
    }

    if method == Method::GET && path.ends_with("/metricDescriptors") {
        let page = query
            .get("pageToken")
            .and_then(|token| token.strip_prefix("page-"))
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);
        let project = path.trim_start_matches("/v3/").trim_end_matches("/metricDescriptors");
        let names = state.descriptor_pages.get(page).cloned().unwrap_or_default();
        let descriptors: Vec<Value> = names
            .iter()
            .map(|metric_type| {
                json!({
                    "name": format!("{project}/metricDescriptors/{metric_type}"),
                    "type": metric_type,
                })
            })
            .collect();

        let mut response = json!({ "metricDescriptors": descriptors });
        if page + 1 < state.descriptor_pages.len() {
            response["nextPageToken"] = json!(format!("page-{}", page + 1));
        }
        return Json(response).into_response();
    }

    if method == Method::DELETE && path.contains("/metricDescriptors/") {
        return Json(json!({})).into_response();
    }

    error_body(StatusCode::NOT_FOUND)
}
