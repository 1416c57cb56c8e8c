//! HTTP surface of the aggregator gateway.
//!
//! Serves registry reads (instances, events), the gateway identity route
//! used by singleton detection, and the per-instance pass-through
//! operations. Rendering is left to the consumer; every response is plain
//! JSON.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::{ProxyError, RegistryError};
use crate::proxy::AggregatorProxy;
use crate::registry::{InstanceRecord, LifecycleEvent, RegistryStore};

/// Identity tag returned by `/api/health`, checked by singleton detection.
pub const GATEWAY_SERVICE_NAME: &str = "muster-gateway";

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub store: RegistryStore,
    pub proxy: AggregatorProxy,
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/instances", get(list_instances))
        .route("/api/instances/{pid}", get(get_instance))
        .route("/api/events", get(list_events))
        .route("/api/instances/{pid}/logs", get(instance_logs))
        .route(
            "/api/instances/{pid}/tool-stats",
            get(instance_tool_stats).delete(clear_instance_tool_stats),
        )
        .route("/api/instances/{pid}/config", get(instance_config))
        .route("/api/instances/{pid}/executions", get(instance_executions))
        .route("/api/instances/{pid}/shutdown", put(shutdown_instance))
        .route("/api/instances/{pid}/force-kill", post(force_kill_instance))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::NotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::Unreachable { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ProxyError::Registry(RegistryError::LockTimeout { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// An instance record plus its display label.
#[derive(Debug, Serialize)]
struct InstanceView {
    #[serde(flatten)]
    record: InstanceRecord,
    label: String,
}

impl From<InstanceRecord> for InstanceView {
    fn from(record: InstanceRecord) -> Self {
        let label = record.label();
        Self { record, label }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": GATEWAY_SERVICE_NAME,
        "pid": std::process::id(),
    }))
}

async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<Vec<InstanceView>>, ProxyError> {
    let instances = state.store.list().await.map_err(ProxyError::from)?;
    Ok(Json(instances.into_iter().map(InstanceView::from).collect()))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<InstanceView>, ProxyError> {
    match state.store.get(pid).await {
        Ok(record) => Ok(Json(record.into())),
        Err(RegistryError::NotFound { pid }) => Err(ProxyError::NotFound { pid }),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<LifecycleEvent>>, ProxyError> {
    let events = state
        .store
        .events(query.limit.unwrap_or(100))
        .await
        .map_err(ProxyError::from)?;
    Ok(Json(events))
}

async fn instance_logs(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    state.proxy.fetch_logs(pid).await.map(Json)
}

async fn instance_tool_stats(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    state.proxy.tool_stats(pid).await.map(Json)
}

async fn clear_instance_tool_stats(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    state.proxy.clear_tool_stats(pid).await.map(Json)
}

async fn instance_config(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    state.proxy.config_overview(pid).await.map(Json)
}

async fn instance_executions(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    state.proxy.executions(pid).await.map(Json)
}

async fn shutdown_instance(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    state.proxy.shutdown(pid).await?;
    Ok(Json(serde_json::json!({ "stopped": pid })))
}

async fn force_kill_instance(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let killed = state.proxy.force_kill(pid).await?;
    Ok(Json(serde_json::json!({ "pid": pid, "killed": killed })))
}
