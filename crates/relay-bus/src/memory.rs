//! In-process bus backend.
//!
//! Channels are `tokio::sync::broadcast` senders created on first use. The
//! bus can be taken offline and its subscriptions severed, which is how
//! reconnect behaviour is exercised without a real broker.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, future};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::bus::{BusStream, MessageBus, PresenceStore, RawMessage, WorkQueue};
use crate::error::BusError;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// In-memory implementation of every bus interface.
pub struct InMemoryBus {
    inner: Mutex<Inner>,
    channel_capacity: usize,
}

struct Inner {
    online: bool,
    channels: HashMap<String, broadcast::Sender<RawMessage>>,
    lists: HashMap<String, VecDeque<String>>,
    keys: HashMap<String, (String, Instant)>,
}

impl InMemoryBus {
    /// Create an online bus.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create an online bus whose channels buffer `capacity` messages per
    /// lagging subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                online: true,
                channels: HashMap::new(),
                lists: HashMap::new(),
                keys: HashMap::new(),
            }),
            channel_capacity: capacity.max(1),
        }
    }

    /// Take the bus offline: live subscriptions end and new calls fail.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.online = false;
        inner.channels.clear();
    }

    /// Bring the bus back online.
    pub fn reconnect(&self) {
        self.inner.lock().online = true;
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .channels
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Pop the oldest job from `queue` (the `RPOP` side of the queue).
    pub fn pop_job(&self, queue: &str) -> Option<String> {
        self.inner.lock().lists.get_mut(queue)?.pop_back()
    }

    /// Read an unexpired key.
    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock();
        let (value, expires_at) = inner.keys.get(key)?;
        (Instant::now() < *expires_at).then(|| value.clone())
    }

    fn ensure_online(inner: &Inner) -> Result<(), BusError> {
        if inner.online {
            Ok(())
        } else {
            Err(BusError::Unavailable("in-memory bus is offline".into()))
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn subscribe(&self, channels: &[String]) -> Result<BusStream, BusError> {
        let receivers = {
            let mut inner = self.inner.lock();
            Self::ensure_online(&inner)?;
            let capacity = self.channel_capacity;
            channels
                .iter()
                .map(|name| {
                    inner
                        .channels
                        .entry(name.clone())
                        .or_insert_with(|| broadcast::channel(capacity).0)
                        .subscribe()
                })
                .collect::<Vec<_>>()
        };

        let streams = receivers.into_iter().map(|rx| {
            BroadcastStream::new(rx).filter_map(|item| {
                future::ready(match item {
                    Ok(msg) => Some(Ok::<_, BusError>(msg)),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "in-memory subscriber lagged");
                        None
                    }
                })
            })
        });
        Ok(Box::pin(futures::stream::select_all(streams)))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64, BusError> {
        let inner = self.inner.lock();
        Self::ensure_online(&inner)?;
        let delivered = inner
            .channels
            .get(channel)
            .and_then(|tx| tx.send(RawMessage::new(channel, payload)).ok())
            .unwrap_or(0);
        Ok(delivered as u64)
    }
}

#[async_trait]
impl WorkQueue for InMemoryBus {
    async fn push(&self, queue: &str, job: &str) -> Result<u64, BusError> {
        let mut inner = self.inner.lock();
        Self::ensure_online(&inner)?;
        let list = inner.lists.entry(queue.to_owned()).or_default();
        list.push_front(job.to_owned());
        Ok(list.len() as u64)
    }
}

#[async_trait]
impl PresenceStore for InMemoryBus {
    async fn set_expiring(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BusError> {
        let mut inner = self.inner.lock();
        Self::ensure_online(&inner)?;
        let _ = inner
            .keys
            .insert(key.to_owned(), (value.to_owned(), Instant::now() + ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe(&channels(&["RAPD_RESULTS"])).await.unwrap();
        let n = bus.publish("RAPD_RESULTS", Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(n, 1);
        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(msg.channel, "RAPD_RESULTS");
        assert_eq!(&msg.payload[..], b"{}");
    }

    #[tokio::test]
    async fn publish_without_subscribers_counts_zero() {
        let bus = InMemoryBus::new();
        assert_eq!(bus.publish("X", Bytes::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn multi_channel_subscription() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe(&channels(&["A", "B"])).await.unwrap();
        let _ = bus.publish("B", Bytes::from_static(b"b")).await.unwrap();
        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(msg.channel, "B");
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_to_retained_messages() {
        let bus = InMemoryBus::with_capacity(2);
        let mut stream = bus.subscribe(&channels(&["A", "B"])).await.unwrap();
        for payload in [&b"1"[..], b"2", b"3", b"4"] {
            let _ = bus.publish("A", Bytes::copy_from_slice(payload)).await.unwrap();
        }
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(&first.payload[..], b"3");
        assert_eq!(&second.payload[..], b"4");

        let _ = bus.publish("B", Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().channel, "B");
    }

    #[tokio::test]
    async fn disconnect_ends_streams_and_rejects_calls() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe(&channels(&["A"])).await.unwrap();
        bus.disconnect();
        assert!(stream.next().await.is_none());
        assert!(matches!(
            bus.subscribe(&channels(&["A"])).await,
            Err(BusError::Unavailable(_))
        ));
        bus.reconnect();
        assert!(bus.subscribe(&channels(&["A"])).await.is_ok());
    }

    #[tokio::test]
    async fn push_returns_queue_length() {
        let bus = InMemoryBus::new();
        assert_eq!(bus.push("RAPD_JOBS", "{\"a\":1}").await.unwrap(), 1);
        assert_eq!(bus.push("RAPD_JOBS", "{\"a\":2}").await.unwrap(), 2);
        assert_eq!(bus.pop_job("RAPD_JOBS").as_deref(), Some("{\"a\":1}"));
    }

    #[tokio::test(start_paused = true)]
    async fn expiring_keys_expire() {
        let bus = InMemoryBus::new();
        bus.set_expiring("R2:WSS:x", "host", Duration::from_secs(31))
            .await
            .unwrap();
        assert_eq!(bus.get("R2:WSS:x").as_deref(), Some("host"));
        tokio::time::advance(Duration::from_secs(32)).await;
        assert!(bus.get("R2:WSS:x").is_none());
    }
}
