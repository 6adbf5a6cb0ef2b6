//! Gateway runtime configuration.

use std::time::Duration;

use relay_settings::RelaySettings;

/// Resolved gateway parameters.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Bind host.
    pub host: String,
    /// Bind port (0 = ephemeral).
    pub port: u16,
    /// Concurrent WebSocket connections accepted before answering 503.
    pub max_connections: usize,
    /// Per-subscriber outbound queue bound.
    pub queue_capacity: usize,
    /// Ping cadence.
    pub heartbeat_interval: Duration,
    /// Silence tolerated before a connection is dropped.
    pub heartbeat_timeout: Duration,
    /// Largest accepted inbound frame.
    pub max_message_size: usize,
    /// Malformed frames tolerated before closing with 1008.
    pub max_protocol_errors: u32,
    /// Time allowed for first-frame authentication.
    pub handshake_timeout: Duration,
    /// Default queue for `POST /jobs`.
    pub work_queue: String,
    /// Presence refresh cadence; `None` disables presence.
    pub presence_interval: Option<Duration>,
    /// Presence key TTL.
    pub presence_ttl: Duration,
    /// Host name published in presence keys.
    pub instance_host: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1000,
            queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            max_message_size: 64 * 1024,
            max_protocol_errors: 5,
            handshake_timeout: Duration::from_secs(10),
            work_queue: "RAPD_JOBS".into(),
            presence_interval: None,
            presence_ttl: Duration::from_secs(31),
            instance_host: "localhost".into(),
        }
    }
}

impl GatewayConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        let server = &settings.server;
        let instance_host = server
            .instance_host
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "localhost".into());
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            queue_capacity: server.queue_capacity,
            heartbeat_interval: server.heartbeat_interval(),
            heartbeat_timeout: server.heartbeat_timeout(),
            max_message_size: server.max_message_size,
            max_protocol_errors: server.max_protocol_errors,
            handshake_timeout: Duration::from_secs(settings.auth.handshake_timeout_secs),
            work_queue: settings.bus.work_queue.clone(),
            presence_interval: (server.presence_interval_secs > 0)
                .then(|| Duration::from_secs(server.presence_interval_secs)),
            presence_ttl: Duration::from_secs(server.presence_ttl_secs),
            instance_host,
        }
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
