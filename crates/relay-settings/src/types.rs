//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a partial settings file only needs
//! the keys it changes.

use std::collections::BTreeMap;
use std::time::Duration;

use relay_core::logging::LogFormat;
use relay_core::retry::BackoffConfig;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Transport gateway.
    pub server: ServerSettings,
    /// Client authentication.
    pub auth: AuthSettings,
    /// Upstream message bus.
    pub bus: BusSettings,
    /// Replay buffers and eviction.
    pub replay: ReplaySettings,
    /// Ingress router.
    pub proxy: ProxySettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Check ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.server.queue_capacity < 2 {
            return Err(SettingsError::invalid(
                "server.queueCapacity",
                "must be at least 2",
            ));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::invalid(
                "server.heartbeatIntervalSecs",
                "must be positive",
            ));
        }
        if self.server.heartbeat_timeout_secs < self.server.heartbeat_interval_secs {
            return Err(SettingsError::invalid(
                "server.heartbeatTimeoutSecs",
                "must not be shorter than the heartbeat interval",
            ));
        }
        if self.replay.capacity == 0 {
            return Err(SettingsError::invalid("replay.capacity", "must be at least 1"));
        }
        if self.replay.sweep_interval_secs == 0 {
            return Err(SettingsError::invalid(
                "replay.sweepIntervalSecs",
                "must be positive",
            ));
        }
        if self.bus.channels.is_empty() {
            return Err(SettingsError::invalid(
                "bus.channels",
                "at least one channel is required",
            ));
        }
        if self.bus.ingest_buffer == 0 {
            return Err(SettingsError::invalid("bus.ingestBuffer", "must be positive"));
        }
        if !self.proxy.api_prefix.starts_with('/') {
            return Err(SettingsError::invalid(
                "proxy.apiPrefix",
                format!("must start with '/', got {:?}", self.proxy.api_prefix),
            ));
        }
        if self.auth.required && self.auth.secret.is_none() {
            return Err(SettingsError::invalid(
                "auth.secret",
                "required when auth.required is true",
            ));
        }
        Ok(())
    }
}

/// Transport gateway settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (0 picks an ephemeral port).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Per-subscriber outbound queue bound.
    pub queue_capacity: usize,
    /// Seconds between WebSocket pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds without pong or inbound traffic before closing.
    pub heartbeat_timeout_secs: u64,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Malformed control frames tolerated before closing.
    pub max_protocol_errors: u32,
    /// Host name published in presence keys (defaults to `$HOSTNAME`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_host: Option<String>,
    /// Seconds between presence refreshes (0 disables presence).
    pub presence_interval_secs: u64,
    /// TTL of presence keys.
    pub presence_ttl_secs: u64,
    /// Grace period for background tasks on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3100,
            max_connections: 1000,
            queue_capacity: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 64 * 1024,
            max_protocol_errors: 5,
            instance_host: None,
            presence_interval_secs: 30,
            presence_ttl_secs: 31,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerSettings {
    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Heartbeat timeout as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Client authentication settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Reject connections without a valid token.
    pub required: bool,
    /// HS256 signing secret for identity tokens.
    #[serde(skip_serializing)]
    pub secret: Option<SecretString>,
    /// Seconds a client has to authenticate after connecting.
    pub handshake_timeout_secs: u64,
    /// Clock skew tolerance for `exp`/`iat`.
    pub leeway_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            required: false,
            secret: None,
            handshake_timeout_secs: 10,
            leeway_secs: 5,
        }
    }
}

/// Upstream message bus settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// `memory://` or `redis://[:password@]host[:port][/db]`.
    pub url: String,
    /// Channels to ingest.
    pub channels: Vec<String>,
    /// List that job submissions are pushed onto.
    pub work_queue: String,
    /// Capacity of the ingestor → dispatcher queue.
    pub ingest_buffer: usize,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            channels: vec!["RAPD_RESULTS".to_string()],
            work_queue: "RAPD_JOBS".to_string(),
            ingest_buffer: 1024,
            connect_timeout_secs: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Replay buffer settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplaySettings {
    /// Events retained per subscription key.
    pub capacity: usize,
    /// Seconds an unsubscribed buffer is kept before eviction.
    pub grace_period_secs: u64,
    /// Seconds between eviction sweeps.
    pub sweep_interval_secs: u64,
    /// Buffer events for keys nobody has subscribed to yet.
    pub buffer_unclaimed: bool,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            capacity: 50,
            grace_period_secs: 300,
            sweep_interval_secs: 30,
            buffer_unclaimed: true,
        }
    }
}

/// Ingress router settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Path prefix routed to the REST upstream.
    pub api_prefix: String,
    /// REST handlers.
    pub rest_upstream: String,
    /// Transport gateway WebSocket endpoint.
    pub gateway_upstream: String,
    /// Everything else (UI).
    pub ui_upstream: String,
    /// Upstream HTTP request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Maximum buffered request body in bytes.
    pub max_body_bytes: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_prefix: "/api".to_string(),
            rest_upstream: "http://127.0.0.1:3000".to_string(),
            gateway_upstream: "ws://127.0.0.1:3100/ws".to_string(),
            ui_upstream: "http://127.0.0.1:4200".to_string(),
            request_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level directive.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
    /// Per-module level overrides, e.g. `{"relay_hub": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            module_levels: BTreeMap::new(),
        }
    }
}
