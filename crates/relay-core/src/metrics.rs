//! Metric names shared by the hub and the gateway.
//!
//! Recording goes through the `metrics` facade; the Prometheus exporter is
//! installed by the server.

/// Events decoded from the bus (counter, labels: channel).
pub const EVENTS_INGESTED_TOTAL: &str = "relay_events_ingested_total";
/// Bus payloads dropped as malformed (counter, labels: channel).
pub const EVENTS_MALFORMED_TOTAL: &str = "relay_events_malformed_total";
/// Events delivered into at least one buffer (counter, labels: result_kind).
pub const EVENTS_DISPATCHED_TOTAL: &str = "relay_events_dispatched_total";
/// Events with no buffer or subscriber to receive them (counter).
pub const EVENTS_UNMATCHED_TOTAL: &str = "relay_events_unmatched_total";
/// Gap markers enqueued for slow consumers or bus outages (counter, labels: reason).
pub const GAP_MARKERS_TOTAL: &str = "relay_gap_markers_total";
/// Bus reconnect attempts (counter, labels: channel).
pub const BUS_RECONNECTS_TOTAL: &str = "relay_bus_reconnects_total";
/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "relay_ws_connections_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "relay_ws_connections_active";
/// Connections rejected during authentication (counter).
pub const WS_AUTH_FAILURES_TOTAL: &str = "relay_ws_auth_failures_total";
/// Live subscriptions across all connections (gauge).
pub const SUBSCRIPTIONS_ACTIVE: &str = "relay_subscriptions_active";
/// Replay buffers held by the registry (gauge).
pub const REPLAY_BUFFERS_ACTIVE: &str = "relay_replay_buffers_active";
/// Ingress upstream failures (counter, labels: upstream).
pub const PROXY_FAILURES_TOTAL: &str = "relay_proxy_failures_total";
/// Ingress requests forwarded (counter, labels: upstream).
pub const PROXY_REQUESTS_TOTAL: &str = "relay_proxy_requests_total";

/// Every metric name, for exporters and tests.
pub const ALL: &[&str] = &[
    EVENTS_INGESTED_TOTAL,
    EVENTS_MALFORMED_TOTAL,
    EVENTS_DISPATCHED_TOTAL,
    EVENTS_UNMATCHED_TOTAL,
    GAP_MARKERS_TOTAL,
    BUS_RECONNECTS_TOTAL,
    WS_CONNECTIONS_TOTAL,
    WS_CONNECTIONS_ACTIVE,
    WS_AUTH_FAILURES_TOTAL,
    SUBSCRIPTIONS_ACTIVE,
    REPLAY_BUFFERS_ACTIVE,
    PROXY_FAILURES_TOTAL,
    PROXY_REQUESTS_TOTAL,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_prefixed_snake_case() {
        for name in ALL {
            assert!(name.starts_with("relay_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name}"
            );
        }
    }

    #[test]
    fn names_are_unique() {
        let mut sorted = ALL.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ALL.len());
    }
}
