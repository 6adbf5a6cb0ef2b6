//! The ingress router: one fallback handler that classifies every request.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::response::Response;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::IngressConfig;
use crate::error::IngressError;
use crate::forward::forward;
use crate::upgrade::{is_websocket_upgrade, proxy_upgrade};

/// Shared router state.
#[derive(Clone)]
pub struct IngressState {
    /// Routing configuration.
    pub config: Arc<IngressConfig>,
    /// HTTP client for the REST and UI upstreams.
    pub client: reqwest::Client,
}

impl IngressState {
    /// State with a client honouring the configured timeout. Redirects are
    /// passed through to the caller rather than followed.
    pub fn new(config: IngressConfig) -> Result<Self, IngressError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }
}

/// Build the router. Panics inside a handler become `500` responses.
pub fn build_router(state: IngressState) -> Router {
    Router::new()
        .fallback(route)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
}

async fn route(State(state): State<IngressState>, req: Request) -> Response {
    if is_websocket_upgrade(req.headers()) {
        return proxy_upgrade(&state, req).await;
    }
    let upstream = state.config.http_upstream(req.uri().path());
    forward(&state, upstream, req).await
}

/// Handle to a running router.
pub struct IngressHandle {
    /// Bound address.
    pub addr: SocketAddr,
    /// Serve task.
    pub task: JoinHandle<()>,
}

/// Bind and serve until `shutdown`.
pub async fn start(config: IngressConfig, shutdown: CancellationToken) -> Result<IngressHandle, IngressError> {
    let bind = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    let addr = listener.local_addr()?;
    info!(
        %addr,
        api_prefix = %config.api_prefix,
        rest = %config.rest_upstream,
        gateway = %config.gateway_upstream,
        ui = %config.ui_upstream,
        "ingress router listening"
    );
    let router = build_router(IngressState::new(config)?);

    let task = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            warn!(error = %e, "ingress router stopped with error");
        }
    });
    Ok(IngressHandle { addr, task })
}
