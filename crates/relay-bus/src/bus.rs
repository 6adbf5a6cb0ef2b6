//! Bus interfaces.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::BusError;

/// One message received on a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    /// Channel it was published on.
    pub channel: String,
    /// Undecoded body.
    pub payload: Bytes,
}

impl RawMessage {
    /// Build a message from anything byte-like.
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Live subscription. Ends when the connection is lost; a final `Err`
/// may carry the reason.
pub type BusStream = Pin<Box<dyn Stream<Item = Result<RawMessage, BusError>> + Send>>;

/// Channel pub/sub.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Subscribe to `channels`. The stream stays open until the backend
    /// disconnects or the stream is dropped.
    async fn subscribe(&self, channels: &[String]) -> Result<BusStream, BusError>;

    /// Publish a payload, returning how many subscribers received it.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64, BusError>;
}

/// Job submission queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Push a serialized job onto the head of `queue`, returning the new length.
    async fn push(&self, queue: &str, job: &str) -> Result<u64, BusError>;
}

/// Expiring key/value store used for presence.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl`.
    async fn set_expiring(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BusError>;
}
