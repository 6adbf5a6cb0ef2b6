//! Subscription keys.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::Event;
use crate::ids::SessionId;
use crate::result_type::ResultType;

/// `(session_id, result_type)` pair identifying one replayable feed.
///
/// A key whose result type is the wildcard `*` receives every event of the
/// session.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SubscriptionKey {
    /// Session the feed belongs to.
    pub session_id: SessionId,
    /// Result type, or the wildcard.
    pub result_type: ResultType,
}

impl SubscriptionKey {
    /// Exact key.
    pub fn new(session_id: impl Into<SessionId>, result_type: impl Into<ResultType>) -> Self {
        Self {
            session_id: session_id.into(),
            result_type: result_type.into(),
        }
    }

    /// Wildcard key for a session.
    pub fn wildcard(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            result_type: ResultType::wildcard(),
        }
    }

    /// Whether this is a wildcard key.
    pub fn is_wildcard(&self) -> bool {
        self.result_type.is_wildcard()
    }

    /// Whether an event should be delivered on this key.
    pub fn matches(&self, event: &Event) -> bool {
        self.session_id == event.session_id
            && (self.is_wildcard() || self.result_type == event.result_type)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.result_type)
    }
}
