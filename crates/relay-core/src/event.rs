//! The normalized event distributed to subscribers.

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::result_type::ResultType;
use crate::subscription::SubscriptionKey;

/// What happened to a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// A new result record exists.
    ResultAdded,
    /// An existing result record changed.
    ResultUpdated,
    /// The detailed body of a result is available.
    ResultDetails,
    /// Progress of a running job.
    JobStatus,
}

impl Category {
    /// Map an upstream `msg_type` value.
    pub fn from_msg_type(msg_type: &str) -> Option<Self> {
        match msg_type.trim().to_lowercase().as_str() {
            "results" | "result" | "result_added" => Some(Self::ResultAdded),
            "result_update" | "result_updated" => Some(Self::ResultUpdated),
            "result_details" => Some(Self::ResultDetails),
            "job_status" | "status" => Some(Self::JobStatus),
            _ => None,
        }
    }

    /// Snake-case label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResultAdded => "result_added",
            Self::ResultUpdated => "result_updated",
            Self::ResultDetails => "result_details",
            Self::JobStatus => "job_status",
        }
    }
}

/// A decoded upstream message, stamped with its arrival sequence.
///
/// Events are immutable once created and shared as `Arc<Event>` between the
/// replay buffers and subscriber queues.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// What happened.
    pub category: Category,
    /// Owning session.
    pub session_id: SessionId,
    /// Routing tag.
    pub result_type: ResultType,
    /// Opaque body, forwarded verbatim.
    pub payload: serde_json::Value,
    /// Monotonic arrival sequence assigned by the ingestor.
    pub sequence: u64,
    /// Upstream channel the message arrived on.
    #[serde(skip)]
    pub channel: String,
}

impl Event {
    /// Exact key for this event.
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.session_id.clone(), self.result_type.clone())
    }

    /// Wildcard key for this event's session.
    pub fn wildcard_key(&self) -> SubscriptionKey {
        SubscriptionKey::wildcard(self.session_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        Event {
            category: Category::ResultAdded,
            session_id: SessionId::new("S1"),
            result_type: ResultType::new("mx:integrate"),
            payload: serde_json::json!({"result_id": "r1"}),
            sequence: 7,
            channel: "RAPD_RESULTS".into(),
        }
    }

    #[test]
    fn wire_shape() {
        let v = serde_json::to_value(sample()).unwrap();
        assert_eq!(v["category"], "result_added");
        assert_eq!(v["session_id"], "S1");
        assert_eq!(v["result_type"], "mx:integrate");
        assert_eq!(v["sequence"], 7);
        assert_eq!(v["payload"]["result_id"], "r1");
        assert!(v.get("channel").is_none());
    }

    #[test]
    fn keys() {
        let ev = sample();
        assert_eq!(ev.key().result_type.as_str(), "mx:integrate");
        assert!(ev.wildcard_key().is_wildcard());
        assert_eq!(ev.wildcard_key().session_id, ev.session_id);
    }

    #[test]
    fn category_from_msg_type() {
        assert_eq!(Category::from_msg_type("results"), Some(Category::ResultAdded));
        assert_eq!(Category::from_msg_type("RESULT_UPDATE"), Some(Category::ResultUpdated));
        assert_eq!(Category::from_msg_type("status"), Some(Category::JobStatus));
        assert_eq!(Category::from_msg_type("nope"), None);
    }
}
