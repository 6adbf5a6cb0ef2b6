//! Prometheus recorder and `/metrics` rendering.
//!
//! Metric names live in [`relay_core::metrics`] so the hub can record
//! without depending on the exporter.

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use relay_core::metrics as names;
use tracing::info;

/// Install the Prometheus recorder globally and describe every metric.
///
/// Call once at startup, before anything is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_all();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Register help text for every relay metric.
pub fn describe_all() {
    describe_counter!(names::EVENTS_INGESTED_TOTAL, "Events decoded from the bus");
    describe_counter!(names::EVENTS_MALFORMED_TOTAL, "Bus payloads dropped as malformed");
    describe_counter!(names::EVENTS_DISPATCHED_TOTAL, "Events delivered to at least one live subscriber");
    describe_counter!(names::EVENTS_UNMATCHED_TOTAL, "Events no live subscriber received");
    describe_counter!(names::GAP_MARKERS_TOTAL, "Gap markers enqueued");
    describe_counter!(names::BUS_RECONNECTS_TOTAL, "Bus reconnect attempts");
    describe_counter!(names::WS_CONNECTIONS_TOTAL, "WebSocket connections accepted");
    describe_gauge!(names::WS_CONNECTIONS_ACTIVE, "Open WebSocket connections");
    describe_counter!(names::WS_AUTH_FAILURES_TOTAL, "Connections rejected during authentication");
    describe_gauge!(names::SUBSCRIPTIONS_ACTIVE, "Live subscriptions");
    describe_gauge!(names::REPLAY_BUFFERS_ACTIVE, "Replay buffers held by the registry");
    describe_counter!(names::PROXY_FAILURES_TOTAL, "Ingress upstream failures");
    describe_counter!(names::PROXY_REQUESTS_TOTAL, "Ingress requests forwarded");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_recorder_renders() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            describe_all();
            metrics::counter!(names::WS_CONNECTIONS_TOTAL).increment(2);
        });
        let text = render(&handle);
        assert!(text.contains("relay_ws_connections_total 2"), "{text}");
    }
}
