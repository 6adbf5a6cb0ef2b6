//! Wire frames exchanged with WebSocket clients.
//!
//! Client frames are JSON objects tagged by `action`. Server frames are
//! untagged; clients tell them apart by their fields.

use std::sync::Arc;

use relay_core::{Event, ResultType, SessionId, SubscriptionId, SubscriptionKey};
use serde::{Deserialize, Serialize};

/// A control frame sent by the client.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start receiving a key. `result_type` defaults to the wildcard.
    Subscribe {
        /// Session to follow.
        session_id: SessionId,
        /// Result type to follow.
        #[serde(default = "ResultType::wildcard")]
        result_type: ResultType,
    },
    /// Stop a subscription.
    Unsubscribe {
        /// Id returned in the snapshot frame.
        subscription_id: SubscriptionId,
    },
    /// Present a token after connecting.
    Authenticate {
        /// Identity token.
        token: String,
    },
    /// Application-level liveness probe.
    Ping,
}

impl ClientFrame {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::new(ErrorCode::InvalidFrame, e.to_string()))
    }

    /// Key requested by a subscribe frame, validated.
    pub fn subscription_key(session_id: &SessionId, result_type: &ResultType) -> Result<SubscriptionKey, ProtocolError> {
        if session_id.is_blank() {
            return Err(ProtocolError::new(ErrorCode::InvalidSubscription, "session_id is blank"));
        }
        if result_type.is_empty() {
            return Err(ProtocolError::new(ErrorCode::InvalidSubscription, "result_type is blank"));
        }
        Ok(SubscriptionKey::new(session_id.clone(), result_type.clone()))
    }
}

/// Machine-readable error codes carried in error frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Not JSON, unknown action or missing fields.
    InvalidFrame,
    /// Subscribe with an unusable key.
    InvalidSubscription,
    /// The connection already follows that key.
    AlreadySubscribed,
    /// Unsubscribe for an id this connection does not own.
    UnknownSubscription,
    /// Token rejected.
    AuthenticationFailed,
}

/// A client-caused error reported back in an error frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProtocolError {
    /// Error class.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ProtocolError {
    /// Build an error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A frame sent to the client.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Current history of a key, sent once when a subscription starts.
    Snapshot {
        /// New subscription.
        subscription_id: SubscriptionId,
        /// Session subscribed to.
        session_id: SessionId,
        /// Result type subscribed to.
        result_type: ResultType,
        /// Buffered events, oldest first.
        events: Vec<Arc<Event>>,
    },
    /// A live event.
    Event {
        /// Subscription it was delivered on.
        subscription_id: SubscriptionId,
        /// The event.
        event: Arc<Event>,
    },
    /// Events were lost on this subscription.
    Gap {
        /// Affected subscription.
        subscription_id: SubscriptionId,
        /// Always `true`.
        gap: bool,
        /// Events dropped (0 when unknown).
        missed: u64,
    },
    /// Acknowledges an unsubscribe.
    Unsubscribed {
        /// Removed subscription.
        subscription_id: SubscriptionId,
        /// Always `true`.
        unsubscribed: bool,
    },
    /// Acknowledges first-frame authentication.
    Authenticated {
        /// Always `true`.
        authenticated: bool,
    },
    /// Reply to a client ping.
    Pong {
        /// Always `true`.
        pong: bool,
    },
    /// Something the client sent was rejected.
    Error {
        /// Details.
        error: ProtocolError,
    },
}

impl ServerFrame {
    /// Gap marker frame.
    pub fn gap(subscription_id: SubscriptionId, missed: u64) -> Self {
        Self::Gap {
            subscription_id,
            gap: true,
            missed,
        }
    }

    /// Unsubscribe acknowledgement.
    pub fn unsubscribed(subscription_id: SubscriptionId) -> Self {
        Self::Unsubscribed {
            subscription_id,
            unsubscribed: true,
        }
    }

    /// Pong frame.
    pub fn pong() -> Self {
        Self::Pong { pong: true }
    }

    /// Authentication acknowledgement.
    pub fn authenticated() -> Self {
        Self::Authenticated { authenticated: true }
    }

    /// Error frame.
    pub fn error(error: ProtocolError) -> Self {
        Self::Error { error }
    }

    /// Serialize to JSON text.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize server frame");
            String::from(r#"{"error":{"code":"internal","message":"serialization failed"}}"#)
        })
    }
}
