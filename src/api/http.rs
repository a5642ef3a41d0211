//! HTTP Endpoints
//!
//! The request/response side of the cluster protocol. Masters mount the
//! registration and push endpoints, slaves mount sync and health, and
//! both serve pull.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::cluster::{HealthResponse, NodeMeta, SlaveEntry, SlaveRegistry};
use crate::config::Role;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::notify::NotifyHub;
use crate::replication::{ConfigEntry, SyncRequest};
use crate::store::{keys, Store};

/// Shared application state
pub struct AppState {
    /// Process identity
    pub meta: NodeMeta,
    /// Local store
    pub store: Arc<dyn Store>,
    /// Membership registry (master only)
    pub registry: Option<Arc<SlaveRegistry>>,
    /// Replication event queue (master only)
    pub bus: Option<EventBus>,
    /// Local notification hub, so synced entries reach subscribers on
    /// this node too (slave only)
    pub hub: Option<Arc<NotifyHub>>,
    /// Sort tags when building config keys
    pub canonical_tags: bool,
}

// ============ Request/Response Types ============

/// Body of `/register` and `/unregister`
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub id: Uuid,
    pub addr: String,
    pub role: String,
}

/// Body of `/pull`
#[derive(Debug, Serialize, Deserialize)]
pub struct PullRequest {
    pub name: String,
    pub tags: Vec<String>,
}

/// Response of `/pull`
#[derive(Debug, Serialize, Deserialize)]
pub struct PullResponse {
    pub body: String,
}

#[derive(Debug, Serialize)]
struct SlavesResponse {
    slaves: Vec<SlaveEntry>,
}

/// Error wrapper mapping the crate taxonomy onto status codes
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Config(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::NotMaster => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the router for this node's role
pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new().route("/pull", post(handle_pull));

    match state.meta.role {
        Role::Master => {
            router = router
                .route("/register", post(handle_register))
                .route("/unregister", post(handle_unregister))
                .route("/push", post(handle_push))
                .route("/slaves", get(handle_slaves));
        }
        Role::Slave => {
            router = router
                .route("/sync", post(handle_sync))
                .route("/health", get(handle_health));
        }
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve the API on an already-bound listener until `shutdown` resolves
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    tracing::info!("HTTP endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Transport(format!("HTTP server error: {}", e)))
}

// ============ Handlers ============

fn registry(state: &AppState) -> ApiResult<&Arc<SlaveRegistry>> {
    state.registry.as_ref().ok_or(ApiError(Error::NotMaster))
}

async fn handle_register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<&'static str> {
    registry(&state)?.register(req.id, req.addr).await?;
    Ok("OK")
}

async fn handle_unregister(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<&'static str> {
    registry(&state)?.unregister(req.id).await?;
    Ok("OK")
}

async fn handle_slaves(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let slaves = registry(&state)?.list().await;
    Ok(Json(SlavesResponse { slaves }))
}

/// Write the entry, then hand both replication events to the queue from a
/// detached task so the response never waits on a stalled consumer.
async fn handle_push(
    State(state): State<Arc<AppState>>,
    Json(entry): Json<ConfigEntry>,
) -> ApiResult<&'static str> {
    let key = keys::config_key(&entry.name, &entry.tags, state.canonical_tags);
    state
        .store
        .put(key.as_bytes(), entry.body.as_bytes())
        .map_err(|e| Error::Persistence(format!("push {}: {}", key, e)))?;

    if let Some(bus) = &state.bus {
        bus.emit_all_detached(vec![
            Event::PubConfig {
                topic: key.clone(),
                payload: entry.body.into_bytes(),
            },
            Event::SyncConfig,
        ]);
    }

    tracing::info!("Config [{}] pushed", key);
    Ok("OK")
}

/// Bulk-overwrite the local config keyspace from a master snapshot, then
/// hand every entry to subscribers watching this node.
async fn handle_sync(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncRequest>,
) -> ApiResult<&'static str> {
    for entry in req.datum {
        let key = keys::config_key(&entry.name, &entry.tags, state.canonical_tags);
        state
            .store
            .put(key.as_bytes(), entry.body.as_bytes())
            .map_err(|e| Error::Persistence(format!("sync {}: {}", key, e)))?;
        if let Some(hub) = &state.hub {
            if let Err(e) = hub.publish(&key, entry.body.as_bytes()).await {
                tracing::info!("Publish [{}] failure: {}", key, e);
            }
        }
        tracing::info!("Config [{}] sync success", key);
    }
    Ok("OK")
}

async fn handle_pull(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PullRequest>,
) -> ApiResult<Json<PullResponse>> {
    let key = keys::config_key(&req.name, &req.tags, state.canonical_tags);
    let value = state
        .store
        .get(key.as_bytes())
        .map_err(|e| Error::Persistence(format!("pull {}: {}", key, e)))?
        .ok_or_else(|| Error::NotFound(key))?;

    Ok(Json(PullResponse {
        body: String::from_utf8_lossy(&value).to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct HealthQuery {
    id: Uuid,
}

/// Liveness probe: succeeds only when the probed id is this node's id,
/// so the master notices when another process takes over the address.
async fn handle_health(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> Response {
    let matches = query.id == state.meta.id;
    let body = Json(HealthResponse {
        healthy: matches,
        id: state.meta.id,
    });
    if matches {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::CONFLICT, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::store::MemoryStore;

    fn meta(role: Role) -> NodeMeta {
        NodeMeta {
            id: Uuid::new_v4(),
            role,
            local_addr: "127.0.0.1:0".into(),
            advertise_addr: "127.0.0.1:0".into(),
            master_addr: None,
        }
    }

    async fn spawn_node(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let app = router(Arc::new(state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn spawn_master(store: Arc<dyn Store>) -> String {
        let registry = Arc::new(SlaveRegistry::new(Arc::clone(&store)));
        let (bus, _rx) = crate::events::channel(5);
        spawn_node(AppState {
            meta: meta(Role::Master),
            store,
            registry: Some(registry),
            bus: Some(bus),
            hub: None,
            canonical_tags: false,
        })
        .await
    }

    fn entry(name: &str, tags: &[&str], body: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "tags": tags,
            "body": body,
        })
    }

    #[tokio::test]
    async fn test_push_pull_round_trip() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let addr = spawn_master(store).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{}/push", addr))
            .json(&entry("test", &["app:lll", "ccc:wewf"], "X"))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());

        // Same tag order: hit.
        let resp = client
            .post(format!("http://{}/pull", addr))
            .json(&serde_json::json!({"name": "test", "tags": ["app:lll", "ccc:wewf"]}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        let body: PullResponse = resp.json().await.unwrap();
        assert_eq!(body.body, "X");

        // Reordered tags address a distinct key: not found.
        let resp = client
            .post(format!("http://{}/pull", addr))
            .json(&serde_json::json!({"name": "test", "tags": ["ccc:wewf", "app:lll"]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = Arc::new(SlaveRegistry::new(Arc::clone(&store)));
        let (bus, _rx) = crate::events::channel(5);
        let addr = spawn_node(AppState {
            meta: meta(Role::Master),
            store,
            registry: Some(Arc::clone(&registry)),
            bus: Some(bus),
            hub: None,
            canonical_tags: false,
        })
        .await;

        let client = reqwest::Client::new();
        let id = Uuid::new_v4();
        let req = serde_json::json!({"id": id, "addr": "10.0.0.1:9019", "role": "slave"});

        let resp = client
            .post(format!("http://{}/register", addr))
            .json(&req)
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert_eq!(registry.len().await, 1);

        let resp = client
            .post(format!("http://{}/unregister", addr))
            .json(&req)
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_sync_overwrites_slave_entries() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let addr = spawn_node(AppState {
            meta: meta(Role::Slave),
            store: Arc::clone(&store),
            registry: None,
            bus: None,
            hub: None,
            canonical_tags: false,
        })
        .await;

        let client = reqwest::Client::new();
        let req = serde_json::json!({
            "datum": [
                {"name": "a", "tags": ["t1"], "body": "1"},
                {"name": "b", "tags": ["t2", "t3"], "body": "2"},
            ]
        });
        let resp = client
            .post(format!("http://{}/sync", addr))
            .json(&req)
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());

        assert_eq!(store.get(b"config/a/t1").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"config/b/t2#t3").unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_health_echoes_identity() {
        let node_meta = meta(Role::Slave);
        let own_id = node_meta.id;
        let addr = spawn_node(AppState {
            meta: node_meta,
            store: Arc::new(MemoryStore::new()),
            registry: None,
            bus: None,
            hub: None,
            canonical_tags: false,
        })
        .await;

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{}/health?id={}", addr, own_id))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        let body: HealthResponse = resp.json().await.unwrap();
        assert!(body.healthy);
        assert_eq!(body.id, own_id);

        let resp = client
            .get(format!("http://{}/health?id={}", addr, Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_canonical_tags_collapse_ordering() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = Arc::new(SlaveRegistry::new(Arc::clone(&store)));
        let (bus, _rx) = crate::events::channel(5);
        let addr = spawn_node(AppState {
            meta: meta(Role::Master),
            store,
            registry: Some(registry),
            bus: Some(bus),
            hub: None,
            canonical_tags: true,
        })
        .await;

        let client = reqwest::Client::new();
        client
            .post(format!("http://{}/push", addr))
            .json(&entry("test", &["b", "a"], "X"))
            .send()
            .await
            .unwrap();

        let resp = client
            .post(format!("http://{}/pull", addr))
            .json(&serde_json::json!({"name": "test", "tags": ["a", "b"]}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
    }
}
