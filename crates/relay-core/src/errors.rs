//! Error taxonomy shared across the relay.

use thiserror::Error;

use crate::ids::SubscriptionId;

/// Close code sent when a client fails authentication.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Close code for protocol violations (RFC 6455 "policy violation").
pub const CLOSE_POLICY: u16 = 1008;
/// Close code for server-side failures (RFC 6455 "internal error").
pub const CLOSE_INTERNAL: u16 = 1011;

/// Errors surfaced by relay components.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The message bus connection was lost or could not be established.
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// An upstream payload could not be decoded into an event.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A client presented a missing, expired or invalid token.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A subscriber's outbound queue overflowed and events were dropped.
    #[error("slow consumer {subscription_id}: {missed} events dropped")]
    SlowConsumer {
        /// Affected subscription.
        subscription_id: SubscriptionId,
        /// Events dropped so far.
        missed: u64,
    },

    /// An internal ordering or bookkeeping invariant was broken.
    #[error("registry invariant violated: {0}")]
    RegistryInvariantViolation(String),

    /// The ingress router could not reach an upstream.
    #[error("upstream proxy failure: {0}")]
    UpstreamProxyFailure(String),
}

impl RelayError {
    /// Whether retrying the operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BusUnavailable(_) | Self::UpstreamProxyFailure(_))
    }

    /// Whether the process should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RegistryInvariantViolation(_))
    }

    /// Stable snake-case label for logs and metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::BusUnavailable(_) => "bus_unavailable",
            Self::MalformedMessage(_) => "malformed_message",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::SlowConsumer { .. } => "slow_consumer",
            Self::RegistryInvariantViolation(_) => "registry_invariant_violation",
            Self::UpstreamProxyFailure(_) => "upstream_proxy_failure",
        }
    }

    /// WebSocket close code to use when this error ends a connection.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::AuthenticationFailed(_) => CLOSE_AUTH_FAILED,
            Self::MalformedMessage(_) => CLOSE_POLICY,
            _ => CLOSE_INTERNAL,
        }
    }
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RelayError::BusUnavailable("reset".into()).is_retryable());
        assert!(RelayError::UpstreamProxyFailure("refused".into()).is_retryable());
        assert!(!RelayError::MalformedMessage("x".into()).is_retryable());
        assert!(!RelayError::AuthenticationFailed("x".into()).is_retryable());
    }

    #[test]
    fn only_invariant_violation_is_fatal() {
        assert!(RelayError::RegistryInvariantViolation("x".into()).is_fatal());
        assert!(!RelayError::BusUnavailable("x".into()).is_fatal());
    }

    #[test]
    fn close_codes() {
        assert_eq!(RelayError::AuthenticationFailed("x".into()).close_code(), 4001);
        assert_eq!(RelayError::MalformedMessage("x".into()).close_code(), 1008);
        assert_eq!(RelayError::BusUnavailable("x".into()).close_code(), 1011);
    }

    #[test]
    fn slow_consumer_display() {
        let err = RelayError::SlowConsumer {
            subscription_id: SubscriptionId::from_raw("sub_1"),
            missed: 3,
        };
        assert_eq!(err.to_string(), "slow consumer sub_1: 3 events dropped");
        assert_eq!(err.error_kind(), "slow_consumer");
    }
}
