//! `/health` body.

use serde::Serialize;
use std::time::Instant;

use crate::gateway::Gateway;

/// Lifecycle status reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Accepting connections.
    Ok,
    /// Shutdown started; connections are being closed.
    Draining,
}

/// `/health` response.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: Status,
    pub uptime_secs: u64,
    pub connections: usize,
    pub subscriptions: usize,
    pub replay_buffers: usize,
}

/// Read the gateway and registry counters.
pub fn health_check(start_time: Instant, gateway: &Gateway) -> HealthResponse {
    let registry = gateway.registry();
    HealthResponse {
        status: if gateway.is_draining() { Status::Draining } else { Status::Ok },
        uptime_secs: start_time.elapsed().as_secs(),
        connections: gateway.connection_count(),
        subscriptions: registry.subscription_count(),
        replay_buffers: registry.key_count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use relay_hub::{Registry, RegistryConfig};
    use tokio_util::sync::CancellationToken;

    use crate::auth::Authenticator;
    use crate::config::GatewayConfig;

    fn gateway(shutdown: CancellationToken) -> Gateway {
        Gateway::new(
            Arc::new(Registry::new(RegistryConfig::default())),
            Authenticator::new(None, false),
            GatewayConfig::default(),
            shutdown,
        )
    }

    #[test]
    fn idle_gateway_is_ok() {
        let resp = health_check(Instant::now(), &gateway(CancellationToken::new()));
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.connections, 0);
        assert_eq!(resp.replay_buffers, 0);
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn reports_draining_after_shutdown() {
        let shutdown = CancellationToken::new();
        let gw = gateway(shutdown.clone());
        shutdown.cancel();
        let start = Instant::now().checked_sub(Duration::from_secs(60)).unwrap();
        let body = serde_json::to_value(health_check(start, &gw)).unwrap();
        assert_eq!(body["status"], "draining");
        assert!(body["uptime_secs"].as_u64().unwrap() >= 59);
    }
}
