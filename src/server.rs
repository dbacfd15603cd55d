//! HTTP surface.
//!
//! # Endpoints
//!
//! - `GET /health`: Health check
//! - `GET /api/ditto/{collection}/count`: Remote document count for a collection
//! - `POST /sync/execute-query`: Run a query against the local replica
//! - `GET /sync/status`: Orchestrator state
//! - `POST /sync/run`: Run a bulk sync and return its summary

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::collections::CollectionName;
use crate::remote::{ForwardError, HttpApiClient};
use crate::store::LocalStore;
use crate::sync::{OrchestratorState, SyncError, SyncOrchestrator, SyncSummary};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub client: Arc<HttpApiClient>,
    pub store: Arc<dyn LocalStore>,
    /// Predicate sent with count requests
    pub count_filter: String,
}

/// Builds the router with all routes and request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ditto/{collection}/count", get(collection_count))
        .route("/sync/execute-query", post(execute_query))
        .route("/sync/status", get(sync_status))
        .route("/sync/run", post(run_sync))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Errors
// ============================================================================

/// Error body
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

/// Error returned by handlers
#[derive(Debug)]
enum ApiError {
    UnknownCollection(String),
    Forward(ForwardError),
    Sync(SyncError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::UnknownCollection(name) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: "unknown_collection",
                    message: format!("Unknown collection: {}", name),
                    details: None,
                },
            ),
            ApiError::Forward(err) => {
                let status = StatusCode::from_u16(err.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let message = err.to_string();
                let details = match err {
                    ForwardError::Upstream { body, .. } => Some(body),
                    _ => None,
                };
                (
                    status,
                    ErrorBody {
                        error: "forward_failed",
                        message,
                        details,
                    },
                )
            }
            ApiError::Sync(err) => {
                let (status, error) = match err {
                    SyncError::AlreadyRunning => (StatusCode::CONFLICT, "sync_in_progress"),
                    SyncError::RemoteUnavailable => {
                        (StatusCode::SERVICE_UNAVAILABLE, "remote_unavailable")
                    }
                    SyncError::ShutDown => (StatusCode::SERVICE_UNAVAILABLE, "shut_down"),
                };
                (
                    status,
                    ErrorBody {
                        error,
                        message: err.to_string(),
                        details: None,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<ForwardError> for ApiError {
    fn from(err: ForwardError) -> Self {
        ApiError::Forward(err)
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::Sync(err)
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Forwards a count request for `collection` to the remote API.
async fn collection_count(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let collection =
        CollectionName::parse(&collection).ok_or(ApiError::UnknownCollection(collection))?;

    let body = state
        .client
        .get_document_counts(&state.count_filter, collection.as_str())
        .await?;
    Ok(Json(body))
}

#[derive(Deserialize)]
struct ExecuteQueryRequest {
    query: String,
}

/// Envelope returned by `/sync/execute-query`
#[derive(Serialize)]
struct ExecuteQueryResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    query: String,
}

async fn execute_query(
    State(state): State<AppState>,
    Json(request): Json<ExecuteQueryRequest>,
) -> Json<ExecuteQueryResponse> {
    match state.store.query(&request.query).await {
        Ok(result) => Json(ExecuteQueryResponse {
            success: true,
            data: Some(result.items.into_iter().map(document_body).collect()),
            error: None,
            query: request.query,
        }),
        Err(e) => {
            tracing::warn!(query = %request.query, error = %e, "Query execution failed");
            Json(ExecuteQueryResponse {
                success: false,
                data: None,
                error: Some(e.to_string()),
                query: request.query,
            })
        }
    }
}

/// The stored document for a replica row, or the row itself when the
/// query did not select a `value` column.
fn document_body(row: Value) -> Value {
    match row {
        Value::Object(mut columns) if columns.contains_key("value") => {
            columns.remove("value").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[derive(Serialize)]
struct StatusResponse {
    state: OrchestratorState,
    subscriptions: usize,
    ready: bool,
    last_summary: Option<SyncSummary>,
}

async fn sync_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let orchestrator = &state.orchestrator;
    Json(StatusResponse {
        state: orchestrator.state(),
        subscriptions: orchestrator.registry().count().await,
        ready: orchestrator.readiness().is_set(),
        last_summary: orchestrator.last_summary().await,
    })
}

async fn run_sync(State(state): State<AppState>) -> Result<Json<SyncSummary>, ApiError> {
    let summary = state.orchestrator.run_now().await?;
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::ReadinessSignal;
    use crate::registry::SubscriptionRegistry;
    use crate::store::ReplicaStore;
    use crate::sync::SyncSettings;
    use axum::body::Body;
    use axum::http::{header, HeaderMap, Request};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    struct TestApp {
        _dir: TempDir,
        app: Router,
        store: ReplicaStore,
        orchestrator: Arc<SyncOrchestrator>,
    }

    async fn setup(remote_url: &str) -> TestApp {
        let dir = tempdir().unwrap();
        let store = ReplicaStore::open(&dir.path().join("replica.db"))
            .await
            .unwrap();
        store.start_sync();

        let local: Arc<dyn LocalStore> = Arc::new(store.clone());
        let client = Arc::new(
            HttpApiClient::new(remote_url, Some("secret".to_string()), Duration::from_secs(2))
                .unwrap()
                .with_replica(local.clone()),
        );
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(store.clone())));
        let settings = SyncSettings {
            batch_interval: Duration::from_millis(10),
            ..SyncSettings::default()
        };
        let orchestrator = Arc::new(SyncOrchestrator::new(
            client.clone(),
            local.clone(),
            registry,
            ReadinessSignal::new(),
            settings,
        ));

        let app = router(AppState {
            orchestrator: orchestrator.clone(),
            client,
            store: local,
            count_filter: "status == 1".to_string(),
        });

        TestApp {
            _dir: dir,
            app,
            store,
            orchestrator,
        }
    }

    /// Starts a stand-in remote API answering `/api/v5/store/count` from `counts`.
    async fn spawn_remote(counts: HashMap<&'static str, u64>) -> String {
        let counts = Arc::new(counts);
        let remote = Router::new().route(
            "/api/v5/store/count",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let counts = counts.clone();
                async move {
                    if headers.get(header::AUTHORIZATION).and_then(|h| h.to_str().ok())
                        != Some("secret")
                    {
                        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "bad key" })));
                    }
                    let collection = body["collection"].as_str().unwrap_or_default();
                    let count = counts.get(collection).copied().unwrap_or(0);
                    (StatusCode::OK, Json(json!({ "count": count, "query": body["query"] })))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, remote).await.unwrap();
        });
        format!("http://{}/api/v5", addr)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let t = setup("http://127.0.0.1:9").await;
        let (status, body) = send(t.app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_count_unknown_collection_is_404() {
        let t = setup("http://127.0.0.1:9").await;
        let (status, body) = send(t.app, get_request("/api/ditto/Vehicle/count")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown_collection");
    }

    #[tokio::test]
    async fn test_count_forwards_to_remote() {
        let remote = spawn_remote(HashMap::from([("ERPMasterData", 42)])).await;
        let t = setup(&remote).await;

        let (status, body) = send(t.app, get_request("/api/ditto/ERPMasterData/count")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 42);
        assert_eq!(body["query"], "status == 1");
    }

    #[tokio::test]
    async fn test_count_while_replica_stopped_is_503() {
        let remote = spawn_remote(HashMap::new()).await;
        let t = setup(&remote).await;
        t.store.stop_sync();

        let (status, _) = send(t.app, get_request("/api/ditto/Asset/count")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_count_remote_unreachable_is_504() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let t = setup(&format!("http://{}/api/v5", addr)).await;

        let (status, body) = send(t.app, get_request("/api/ditto/Asset/count")).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"], "forward_failed");
    }

    #[tokio::test]
    async fn test_execute_query_envelope() {
        let t = setup("http://127.0.0.1:9").await;
        t.store
            .upsert(CollectionName::Asset, "a1", &json!({ "status": 1, "tag": "pump" }))
            .await
            .unwrap();

        let (status, body) = send(
            t.app.clone(),
            post_json("/sync/execute-query", json!({ "query": "SELECT * FROM Asset" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["query"], "SELECT * FROM Asset");
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0], json!({ "status": 1, "tag": "pump" }));

        let (_, body) = send(
            t.app.clone(),
            post_json(
                "/sync/execute-query",
                json!({ "query": "SELECT _id FROM Asset" }),
            ),
        )
        .await;
        assert_eq!(body["data"][0]["_id"], "a1");

        t.store.stop_sync();
        let (_, body) = send(
            t.app,
            post_json("/sync/execute-query", json!({ "query": "SELECT * FROM Asset" })),
        )
        .await;
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn test_status_reports_idle() {
        let t = setup("http://127.0.0.1:9").await;
        let (status, body) = send(t.app, get_request("/sync/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "idle");
        assert_eq!(body["subscriptions"], 0);
        assert_eq!(body["ready"], false);
        assert!(body["last_summary"].is_null());
    }

    #[tokio::test]
    async fn test_run_sync_returns_summary() {
        let remote = spawn_remote(HashMap::from([("Plant", 2)])).await;
        let t = setup(&remote).await;
        for id in ["p1", "p2"] {
            t.store
                .upsert(CollectionName::Plant, id, &json!({ "status": 1 }))
                .await
                .unwrap();
        }

        let (status, body) = send(t.app.clone(), post_json("/sync/run", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["results"].as_array().unwrap().len(), 5);

        let (_, status_body) = send(t.app, get_request("/sync/status")).await;
        assert_eq!(status_body["state"], "completed");
        assert_eq!(status_body["last_summary"]["total"], 2);
    }

    #[tokio::test]
    async fn test_run_sync_remote_unavailable_is_503() {
        let t = setup("http://127.0.0.1:9").await;
        t.store.stop_sync();

        let (status, body) = send(t.app, post_json("/sync/run", json!({}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "remote_unavailable");
    }

    #[tokio::test]
    async fn test_run_sync_remote_unreachable_is_503() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let t = setup(&format!("http://{}/api/v5", addr)).await;

        let (status, body) = send(t.app.clone(), post_json("/sync/run", json!({}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "remote_unavailable");

        let (_, status_body) = send(t.app, get_request("/sync/status")).await;
        assert_eq!(status_body["state"], "failed");
    }

    #[tokio::test]
    async fn test_concurrent_run_is_409() {
        // Replica never reaches the remote count, so the first run keeps retrying
        let remote = spawn_remote(HashMap::from([("Issue", 3)])).await;
        let t = setup(&remote).await;

        let first = tokio::spawn(send(t.app.clone(), post_json("/sync/run", json!({}))));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (status, body) = send(t.app, post_json("/sync/run", json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "sync_in_progress");

        t.orchestrator.shutdown().await;
        let (status, _) = tokio::time::timeout(Duration::from_secs(2), first)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, StatusCode::OK);
    }
}
