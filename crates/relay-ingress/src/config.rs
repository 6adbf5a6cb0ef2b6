//! Router configuration.

use std::time::Duration;

use relay_settings::ProxySettings;

/// Where a request goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upstream {
    /// Transport gateway (WebSocket upgrades).
    Gateway,
    /// REST handlers (paths under the API prefix).
    Rest,
    /// Everything else.
    Ui,
}

impl Upstream {
    /// Metric and log label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Gateway => "gateway",
            Self::Rest => "rest",
            Self::Ui => "ui",
        }
    }
}

/// Resolved router parameters.
#[derive(Clone, Debug)]
pub struct IngressConfig {
    /// Bind host.
    pub host: String,
    /// Bind port (0 = ephemeral).
    pub port: u16,
    /// Path prefix routed to [`Upstream::Rest`].
    pub api_prefix: String,
    /// Base URL of the REST upstream.
    pub rest_upstream: String,
    /// `ws://` URL of the gateway endpoint.
    pub gateway_upstream: String,
    /// Base URL of the UI upstream.
    pub ui_upstream: String,
    /// Upstream HTTP timeout.
    pub request_timeout: Duration,
    /// Largest request body buffered for forwarding.
    pub max_body_bytes: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self::from_settings(&ProxySettings::default())
    }
}

impl IngressConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            api_prefix: settings.api_prefix.clone(),
            rest_upstream: settings.rest_upstream.clone(),
            gateway_upstream: settings.gateway_upstream.clone(),
            ui_upstream: settings.ui_upstream.clone(),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            max_body_bytes: settings.max_body_bytes,
        }
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Upstream for a plain HTTP request to `path`.
    ///
    /// The prefix matches whole segments: with `/api`, `/api` and
    /// `/api/jobs` go to REST but `/apiary` does not.
    pub fn http_upstream(&self, path: &str) -> Upstream {
        let prefix = self.api_prefix.trim_end_matches('/');
        let under_prefix = path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
        if under_prefix { Upstream::Rest } else { Upstream::Ui }
    }

    /// Base URL for an HTTP upstream.
    pub fn base_url(&self, upstream: Upstream) -> &str {
        match upstream {
            Upstream::Gateway => &self.gateway_upstream,
            Upstream::Rest => &self.rest_upstream,
            Upstream::Ui => &self.ui_upstream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let cfg = IngressConfig::default();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.api_prefix, "/api");
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8000");
    }

    #[test]
    fn api_prefix_matches_whole_segments() {
        let cfg = IngressConfig::default();
        assert_eq!(cfg.http_upstream("/api"), Upstream::Rest);
        assert_eq!(cfg.http_upstream("/api/sessions/1"), Upstream::Rest);
        assert_eq!(cfg.http_upstream("/apiary"), Upstream::Ui);
        assert_eq!(cfg.http_upstream("/"), Upstream::Ui);
        assert_eq!(cfg.http_upstream("/dashboard/api"), Upstream::Ui);
    }

    #[test]
    fn trailing_slash_in_prefix() {
        let cfg = IngressConfig {
            api_prefix: "/api/".into(),
            ..IngressConfig::default()
        };
        assert_eq!(cfg.http_upstream("/api/jobs"), Upstream::Rest);
    }
}
