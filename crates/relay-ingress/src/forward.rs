//! Plain HTTP forwarding.

use axum::body::{Body, to_bytes};
use axum::extract::Request;
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use relay_core::RelayError;
use relay_core::metrics::{PROXY_FAILURES_TOTAL, PROXY_REQUESTS_TOTAL};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Upstream;
use crate::router::IngressState;

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in &named {
        let _ = headers.remove(name);
    }
    for name in HOP_BY_HOP {
        let _ = headers.remove(*name);
    }
}

/// A 502 with a JSON body.
pub fn bad_gateway(upstream: Upstream, err: &RelayError) -> Response {
    metrics::counter!(PROXY_FAILURES_TOTAL, "upstream" => upstream.label()).increment(1);
    warn!(upstream = upstream.label(), error = %err, kind = err.error_kind(), "upstream request failed");
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "error": err.error_kind(), "message": err.to_string() })),
    )
        .into_response()
}

/// Forward `req` to `upstream` and stream the answer back.
pub async fn forward(state: &IngressState, upstream: Upstream, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let base = state.config.base_url(upstream).trim_end_matches('/');
    let url = format!("{base}{path}");

    let Ok(body) = to_bytes(body, state.config.max_body_bytes).await else {
        return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
    };

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    if let Some(host) = headers.remove(header::HOST) {
        let _ = headers.insert("x-forwarded-host", host);
    }

    metrics::counter!(PROXY_REQUESTS_TOTAL, "upstream" => upstream.label()).increment(1);
    debug!(upstream = upstream.label(), method = %parts.method, %url, "forwarding request");

    let sent = state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;
    let resp = match sent {
        Ok(resp) => resp,
        Err(e) => return bad_gateway(upstream, &RelayError::UpstreamProxyFailure(format!("{url}: {e}"))),
    };

    let status = resp.status();
    let mut resp_headers = resp.headers().clone();
    strip_hop_by_hop(&mut resp_headers);
    let mut out = Response::new(Body::from_stream(resp.bytes_stream()));
    *out.status_mut() = status;
    *out.headers_mut() = resp_headers;
    let _ = out
        .headers_mut()
        .entry("via")
        .or_insert(HeaderValue::from_static("1.1 relay"));
    out
}
