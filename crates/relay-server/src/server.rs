//! Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use relay_bus::WorkQueue;
use relay_core::{ResultKind, ResultType, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::gateway::protocol::ClientFrame;
use crate::gateway::{Gateway, serve_connection};
use crate::health::{self, HealthResponse};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// WebSocket gateway and, through it, the registry.
    pub gateway: Arc<Gateway>,
    /// Job submission queue.
    pub jobs: Arc<dyn WorkQueue>,
    /// Prometheus handle for `/metrics`.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/jobs", post(jobs_handler))
        .route("/result-types", get(result_types_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Handle to a running server.
pub struct ServerHandle {
    /// Bound address.
    pub addr: SocketAddr,
    /// Serve task; finishes after shutdown once connections drain.
    pub task: JoinHandle<()>,
}

/// Bind the gateway's configured address and serve until `shutdown`.
pub async fn start(state: AppState, shutdown: CancellationToken) -> Result<ServerHandle, std::io::Error> {
    let bind = state.gateway.config().bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    let addr = listener.local_addr()?;
    let router = build_router(state);
    info!(%addr, "relay server listening");

    let task = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            warn!(error = %e, "server stopped with error");
        }
    });
    Ok(ServerHandle { addr, task })
}

#[derive(Deserialize)]
struct WsParams {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_owned())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let Some(slot) = state.gateway.try_acquire_slot() else {
        warn!(
            max = state.gateway.config().max_connections,
            "connection limit reached, refusing upgrade"
        );
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "too many connections");
    };
    let token = params.token.or_else(|| bearer_token(&headers));
    let gateway = Arc::clone(&state.gateway);
    ws.max_message_size(gateway.config().max_message_size)
        .on_upgrade(move |socket| serve_connection(gateway, socket, token, slot))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, &state.gateway))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(&state.metrics),
    )
}

#[derive(Deserialize)]
struct SnapshotParams {
    session_id: Option<String>,
    result_type: Option<String>,
}

/// GET /snapshot?session_id=&result_type=
async fn snapshot_handler(State(state): State<AppState>, Query(params): Query<SnapshotParams>) -> Response {
    let Some(session_id) = params.session_id else {
        return error_body(StatusCode::BAD_REQUEST, "session_id is required");
    };
    let result_type = params.result_type.map_or_else(ResultType::wildcard, ResultType::new);
    let key = match ClientFrame::subscription_key(&SessionId::new(session_id), &result_type) {
        Ok(key) => key,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e.message),
    };
    match state.gateway.registry().peek(&key) {
        Some(events) => Json(json!({
            "session_id": key.session_id,
            "result_type": key.result_type,
            "events": events,
        }))
        .into_response(),
        None => error_body(StatusCode::NOT_FOUND, format!("no buffer for {key}")),
    }
}

#[derive(Deserialize)]
struct JobRequest {
    #[serde(default)]
    queue: Option<String>,
    job: Value,
}

#[derive(Serialize)]
struct JobAccepted {
    queue: String,
    queue_length: u64,
}

/// POST /jobs
async fn jobs_handler(State(state): State<AppState>, Json(req): Json<JobRequest>) -> Response {
    let queue = req
        .queue
        .filter(|q| !q.trim().is_empty())
        .unwrap_or_else(|| state.gateway.config().work_queue.clone());
    let job = match req.job {
        Value::String(raw) => raw,
        other => other.to_string(),
    };
    match state.jobs.push(&queue, &job).await {
        Ok(queue_length) => {
            info!(%queue, queue_length, "job submitted");
            Json(JobAccepted { queue, queue_length }).into_response()
        }
        Err(e) => {
            warn!(%queue, error = %e, "job submission failed");
            error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

/// GET /result-types
async fn result_types_handler() -> Json<Value> {
    let kinds: Vec<Value> = ResultKind::all()
        .map(|k| json!({ "tag": k.tag(), "label": k.label(), "view": k.view() }))
        .collect();
    Json(Value::Array(kinds))
}
