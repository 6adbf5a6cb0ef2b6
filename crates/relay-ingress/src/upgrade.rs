//! WebSocket upgrade proxying.
//!
//! The upstream connection is opened first; only when it succeeds is the
//! client's upgrade accepted. Frames are then pumped both ways until either
//! side closes.

use axum::extract::FromRequestParts;
use axum::extract::Request;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use relay_core::RelayError;
use reqwest::Url;
use relay_core::metrics::PROXY_REQUESTS_TOTAL;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::config::Upstream;
use crate::forward::bad_gateway;
use crate::router::IngressState;

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Whether the request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    connection_upgrade && upgrade_websocket
}

/// Upstream URL for an upgrade of `path?query`.
///
/// A root `path` keeps the gateway URL's own path; any other path replaces
/// it. The client's query follows the gateway's.
pub fn upstream_url(base: &str, path: &str, query: Option<&str>) -> Result<Url, RelayError> {
    let mut url = Url::parse(base)
        .map_err(|e| RelayError::UpstreamProxyFailure(format!("bad gateway url {base}: {e}")))?;
    if !path.is_empty() && path != "/" {
        url.set_path(path);
    }
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        let merged = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{q}"),
            _ => q.to_owned(),
        };
        url.set_query(Some(&merged));
    }
    Ok(url)
}

/// Proxy an upgrade request to the gateway.
pub async fn proxy_upgrade(state: &IngressState, req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, state).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let url = match upstream_url(&state.config.gateway_upstream, parts.uri.path(), parts.uri.query()) {
        Ok(url) => url,
        Err(e) => return bad_gateway(Upstream::Gateway, &e),
    };
    let upstream = match connect_upstream(url.as_str(), parts.headers.get(header::AUTHORIZATION)).await {
        Ok(socket) => socket,
        Err(e) => return bad_gateway(Upstream::Gateway, &e),
    };

    metrics::counter!(PROXY_REQUESTS_TOTAL, "upstream" => Upstream::Gateway.label()).increment(1);
    info!(%url, "websocket upgrade proxied");
    ws.on_upgrade(move |client| pump(client, upstream))
}

async fn connect_upstream(
    url: &str,
    authorization: Option<&axum::http::HeaderValue>,
) -> Result<UpstreamSocket, RelayError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| RelayError::UpstreamProxyFailure(format!("bad gateway url {url}: {e}")))?;
    if let Some(auth) = authorization {
        let _ = request.headers_mut().insert(header::AUTHORIZATION, auth.clone());
    }
    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| RelayError::UpstreamProxyFailure(format!("{url}: {e}")))?;
    Ok(socket)
}

async fn pump(client: WebSocket, upstream: UpstreamSocket) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let closing = matches!(msg, Message::Close(_));
            if upstream_tx.send(to_upstream(msg)).await.is_err() || closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };
    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let Some(msg) = to_client(msg) else { continue };
            let closing = matches!(msg, Message::Close(_));
            if client_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        () = client_to_upstream => debug!("client side closed"),
        () = upstream_to_client => debug!("gateway side closed"),
    }
}

fn to_upstream(msg: Message) -> UpstreamMessage {
    match msg {
        Message::Text(text) => UpstreamMessage::Text(text.as_str().into()),
        Message::Binary(data) => UpstreamMessage::Binary(data),
        Message::Ping(data) => UpstreamMessage::Ping(data),
        Message::Pong(data) => UpstreamMessage::Pong(data),
        Message::Close(frame) => UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.as_str().into(),
        })),
    }
}

fn to_client(msg: UpstreamMessage) -> Option<Message> {
    Some(match msg {
        UpstreamMessage::Text(text) => Message::Text(text.as_str().into()),
        UpstreamMessage::Binary(data) => Message::Binary(data),
        UpstreamMessage::Ping(data) => Message::Ping(data),
        UpstreamMessage::Pong(data) => Message::Pong(data),
        UpstreamMessage::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        })),
        UpstreamMessage::Frame(_) => return None,
    })
}
