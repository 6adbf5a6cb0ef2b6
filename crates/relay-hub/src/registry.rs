//! Subscription registry.
//!
//! Maps each [`SubscriptionKey`] to its replay buffer and live subscribers.
//! Entries live in a [`DashMap`], so every operation on a key runs under
//! that key's shard lock: a subscribe (snapshot + registration) and a
//! publish (append + enqueue) on the same key never interleave, which is
//! what keeps late joiners from missing or duplicating events.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use relay_core::metrics::{GAP_MARKERS_TOTAL, REPLAY_BUFFERS_ACTIVE, SUBSCRIPTIONS_ACTIVE};
use relay_core::{Event, RelayError, SubscriptionId, SubscriptionKey};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::replay::{DEFAULT_REPLAY_CAPACITY, ReplayBuffer};
use crate::subscriber::{PushOutcome, Subscriber};

/// Registry tuning.
#[derive(Clone, Copy, Debug)]
pub struct RegistryConfig {
    /// Events retained per key.
    pub replay_capacity: usize,
    /// Buffer events for keys nobody is subscribed to yet.
    pub buffer_unclaimed: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            buffer_unclaimed: true,
        }
    }
}

struct KeyEntry {
    buffer: ReplayBuffer,
    subscribers: Vec<Arc<Subscriber>>,
    idle_since: Option<Instant>,
}

impl KeyEntry {
    fn new(capacity: usize, idle_since: Option<Instant>) -> Self {
        Self {
            buffer: ReplayBuffer::new(capacity),
            subscribers: Vec::new(),
            idle_since,
        }
    }
}

/// Thread-safe key → (buffer, subscribers) map.
pub struct Registry {
    entries: DashMap<SubscriptionKey, KeyEntry>,
    config: RegistryConfig,
    subscriptions: AtomicUsize,
}

impl Registry {
    /// Create an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            subscriptions: AtomicUsize::new(0),
        }
    }

    /// Register `subscriber` on `key` and return the key's current history.
    ///
    /// The snapshot and the registration happen atomically with respect to
    /// [`publish_match`](Self::publish_match): every later event is queued
    /// on the subscriber, and every earlier one is in the snapshot.
    pub fn subscribe(&self, key: SubscriptionKey, subscriber: Arc<Subscriber>) -> Vec<Arc<Event>> {
        let mut created = false;
        let snapshot = {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(|| {
                created = true;
                KeyEntry::new(self.config.replay_capacity, None)
            });
            entry.idle_since = None;
            entry.subscribers.push(Arc::clone(&subscriber));
            entry.buffer.snapshot()
        };

        let active = self.subscriptions.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!(SUBSCRIPTIONS_ACTIVE).set(active as f64);
        if created {
            self.record_buffer_count();
        }
        debug!(
            key = %key,
            subscription_id = %subscriber.id(),
            conn_id = %subscriber.connection_id(),
            snapshot_len = snapshot.len(),
            "subscribed"
        );
        snapshot
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    ///
    /// The subscriber is closed so nothing more is queued on it. When the
    /// last subscriber leaves, the key starts its idle grace period.
    pub fn unsubscribe(&self, key: &SubscriptionKey, subscription_id: &SubscriptionId) -> bool {
        let removed = {
            let Some(mut entry) = self.entries.get_mut(key) else {
                return false;
            };
            let Some(pos) = entry.subscribers.iter().position(|s| s.id() == subscription_id) else {
                return false;
            };
            let sub = entry.subscribers.swap_remove(pos);
            if entry.subscribers.is_empty() {
                entry.idle_since = Some(Instant::now());
            }
            sub
        };
        removed.close();

        let active = self
            .subscriptions
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        metrics::gauge!(SUBSCRIPTIONS_ACTIVE).set(active as f64);
        debug!(key = %key, subscription_id = %subscription_id, "unsubscribed");
        true
    }

    /// Append `event` to the buffers of its exact and wildcard keys and
    /// queue it on their subscribers. Returns the subscribers that received
    /// it.
    pub fn publish_match(&self, event: &Arc<Event>) -> Result<Vec<Arc<Subscriber>>, RelayError> {
        let mut delivered = Vec::new();
        let mut created = false;

        for key in [event.key(), event.wildcard_key()] {
            // One key at a time: both may live in the same shard.
            let mut entry = if self.config.buffer_unclaimed {
                self.entries.entry(key).or_insert_with(|| {
                    created = true;
                    KeyEntry::new(self.config.replay_capacity, Some(Instant::now()))
                })
            } else {
                match self.entries.get_mut(&key) {
                    Some(entry) => entry,
                    None => continue,
                }
            };

            let _ = entry.buffer.append(Arc::clone(event))?;
            if entry.subscribers.is_empty() {
                // Idle time counts from the latest event, not the first.
                entry.idle_since = Some(Instant::now());
            }
            for sub in &entry.subscribers {
                match sub.push_event(Arc::clone(event)) {
                    PushOutcome::Queued => delivered.push(Arc::clone(sub)),
                    PushOutcome::Overflowed { first, dropped } => {
                        if first {
                            let err = RelayError::SlowConsumer {
                                subscription_id: sub.id().clone(),
                                missed: dropped,
                            };
                            warn!(
                                conn_id = %sub.connection_id(),
                                error = %err,
                                "subscriber queue overflowed, dropping oldest"
                            );
                            metrics::counter!(GAP_MARKERS_TOTAL, "reason" => "slow_consumer")
                                .increment(1);
                        }
                        delivered.push(Arc::clone(sub));
                    }
                    PushOutcome::Closed => {}
                }
            }
        }

        if created {
            self.record_buffer_count();
        }
        Ok(delivered)
    }

    /// Queue a gap marker on every live subscriber. Returns how many got one.
    pub fn broadcast_gap(&self) -> usize {
        let mut count = 0;
        for entry in &self.entries {
            for sub in &entry.subscribers {
                if sub.push_gap() != PushOutcome::Closed {
                    count += 1;
                }
            }
        }
        count
    }

    /// Current history for `key` without subscribing.
    pub fn peek(&self, key: &SubscriptionKey) -> Option<Vec<Arc<Event>>> {
        self.entries.get(key).map(|entry| entry.buffer.snapshot())
    }

    /// Live subscribers on `key`.
    pub fn subscriber_count(&self, key: &SubscriptionKey) -> usize {
        self.entries
            .get(key)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Live subscriptions across all keys.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Relaxed)
    }

    /// Keys currently holding a buffer.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether `key` holds a buffer.
    pub fn contains_key(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop entries with no subscribers that have been idle for at least
    /// `grace`. Returns the number evicted.
    pub fn evict_idle(&self, now: Instant, grace: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            let expired = entry.subscribers.is_empty()
                && entry
                    .idle_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= grace);
            if expired {
                debug!(key = %key, buffered = entry.buffer.len(), "evicting idle replay buffer");
            }
            !expired
        });
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            self.record_buffer_count();
        }
        evicted
    }

    fn record_buffer_count(&self) {
        metrics::gauge!(REPLAY_BUFFERS_ACTIVE).set(self.entries.len() as f64);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::Outbound;
    use assert_matches::assert_matches;
    use relay_core::{Category, ConnectionId, ResultType, SessionId};
    use tokio::sync::Notify;

    fn ev(session: &str, rt: &str, sequence: u64) -> Arc<Event> {
        Arc::new(Event {
            category: Category::ResultAdded,
            session_id: SessionId::new(session),
            result_type: ResultType::new(rt),
            payload: serde_json::Value::Null,
            sequence,
            channel: String::new(),
        })
    }

    fn sub() -> Arc<Subscriber> {
        Arc::new(Subscriber::new(ConnectionId::new(), 16, Arc::new(Notify::new())))
    }

    fn queued(sub: &Subscriber) -> Vec<u64> {
        sub.drain(usize::MAX)
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Event(e) => Some(e.sequence),
                Outbound::Gap { .. } => None,
            })
            .collect()
    }

    fn seqs(events: &[Arc<Event>]) -> Vec<u64> {
        events.iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn late_joiner_gets_unclaimed_history() {
        let reg = Registry::default();
        let _ = reg.publish_match(&ev("S1", "mx:integrate", 1)).unwrap();
        let snapshot = reg.subscribe(SubscriptionKey::new("S1", "mx:integrate"), sub());
        assert_eq!(seqs(&snapshot), vec![1]);
    }

    #[test]
    fn unclaimed_buffering_can_be_disabled() {
        let reg = Registry::new(RegistryConfig {
            replay_capacity: 10,
            buffer_unclaimed: false,
        });
        let delivered = reg.publish_match(&ev("S1", "mx:integrate", 1)).unwrap();
        assert!(delivered.is_empty());
        assert_eq!(reg.key_count(), 0);
    }

    #[test]
    fn live_events_follow_snapshot() {
        let reg = Registry::default();
        let key = SubscriptionKey::new("S1", "mx:integrate");
        let _ = reg.publish_match(&ev("S1", "mx:integrate", 1)).unwrap();
        let s = sub();
        let snapshot = reg.subscribe(key, Arc::clone(&s));
        let _ = reg.publish_match(&ev("S1", "mx:integrate", 2)).unwrap();
        assert_eq!(seqs(&snapshot), vec![1]);
        assert_eq!(queued(&s), vec![2]);
    }

    #[test]
    fn exact_subscriber_ignores_other_types() {
        let reg = Registry::default();
        let s = sub();
        let _ = reg.subscribe(SubscriptionKey::new("S1", "mx:integrate"), Arc::clone(&s));
        let delivered = reg.publish_match(&ev("S1", "mx:merge", 1)).unwrap();
        assert!(delivered.is_empty());
        assert!(s.is_empty());
    }

    #[test]
    fn wildcard_receives_every_type_once() {
        let reg = Registry::default();
        let wild = sub();
        let exact = sub();
        let _ = reg.subscribe(SubscriptionKey::wildcard("S1"), Arc::clone(&wild));
        let _ = reg.subscribe(SubscriptionKey::new("S1", "mx:integrate"), Arc::clone(&exact));

        let _ = reg.publish_match(&ev("S1", "mx:integrate", 1)).unwrap();
        let _ = reg.publish_match(&ev("S1", "mx:merge", 2)).unwrap();
        let _ = reg.publish_match(&ev("S2", "mx:merge", 3)).unwrap();

        assert_eq!(queued(&wild), vec![1, 2]);
        assert_eq!(queued(&exact), vec![1]);
    }

    #[test]
    fn wildcard_snapshot_spans_types() {
        let reg = Registry::default();
        let _ = reg.publish_match(&ev("S1", "mx:integrate", 1)).unwrap();
        let _ = reg.publish_match(&ev("S1", "mx:merge", 2)).unwrap();
        let snapshot = reg.subscribe(SubscriptionKey::wildcard("S1"), sub());
        assert_eq!(seqs(&snapshot), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let reg = Registry::default();
        let key = SubscriptionKey::new("S1", "mx:sad");
        let s = sub();
        let _ = reg.subscribe(key.clone(), Arc::clone(&s));
        assert_eq!(reg.subscriber_count(&key), 1);
        assert!(reg.unsubscribe(&key, s.id()));
        assert!(!reg.unsubscribe(&key, s.id()));
        assert!(s.is_closed());
        assert_eq!(reg.subscriber_count(&key), 0);
        assert_eq!(reg.subscription_count(), 0);

        let _ = reg.publish_match(&ev("S1", "mx:sad", 1)).unwrap();
        assert!(s.is_empty());
    }

    #[test]
    fn unsubscribe_unknown_key() {
        let reg = Registry::default();
        assert!(!reg.unsubscribe(&SubscriptionKey::new("S1", "mx:sad"), &SubscriptionId::new()));
    }

    #[test]
    fn out_of_order_publish_is_an_invariant_violation() {
        let reg = Registry::default();
        let _ = reg.publish_match(&ev("S1", "mx:sad", 5)).unwrap();
        assert_matches!(
            reg.publish_match(&ev("S1", "mx:sad", 4)),
            Err(RelayError::RegistryInvariantViolation(_))
        );
    }

    #[test]
    fn gap_reaches_every_subscriber() {
        let reg = Registry::default();
        let a = sub();
        let b = sub();
        let _ = reg.subscribe(SubscriptionKey::new("S1", "mx:sad"), Arc::clone(&a));
        let _ = reg.subscribe(SubscriptionKey::wildcard("S2"), Arc::clone(&b));
        assert_eq!(reg.broadcast_gap(), 2);
        assert_eq!(a.pop(), Some(Outbound::Gap { missed: 0 }));
        assert_eq!(b.pop(), Some(Outbound::Gap { missed: 0 }));
    }

    #[test]
    fn peek_does_not_subscribe() {
        let reg = Registry::default();
        let key = SubscriptionKey::new("S1", "mx:mad");
        assert!(reg.peek(&key).is_none());
        let _ = reg.publish_match(&ev("S1", "mx:mad", 1)).unwrap();
        assert_eq!(seqs(&reg.peek(&key).unwrap()), vec![1]);
        assert_eq!(reg.subscriber_count(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entries_are_evicted_after_grace() {
        let reg = Registry::default();
        let grace = Duration::from_secs(300);
        let held = SubscriptionKey::new("S1", "mx:integrate");
        let s = sub();
        let _ = reg.subscribe(held.clone(), Arc::clone(&s));
        let _ = reg.publish_match(&ev("S2", "mx:merge", 1)).unwrap();
        assert_eq!(reg.key_count(), 3);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(reg.evict_idle(Instant::now(), grace), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(reg.evict_idle(Instant::now(), grace), 2);
        assert!(reg.contains_key(&held));

        assert!(reg.unsubscribe(&held, s.id()));
        tokio::time::advance(grace).await;
        assert_eq!(reg.evict_idle(Instant::now(), grace), 1);
        assert_eq!(reg.key_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publishing_keeps_unclaimed_buffer_alive() {
        let reg = Registry::default();
        let grace = Duration::from_secs(300);
        let key = SubscriptionKey::new("S1", "mx:integrate");
        let _ = reg.publish_match(&ev("S1", "mx:integrate", 1)).unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        let _ = reg.publish_match(&ev("S1", "mx:integrate", 2)).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(reg.evict_idle(Instant::now(), grace), 0);

        let snapshot = reg.subscribe(key, sub());
        assert_eq!(seqs(&snapshot), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_buffer_expires_grace_after_last_event() {
        let reg = Registry::default();
        let grace = Duration::from_secs(300);
        let _ = reg.publish_match(&ev("S1", "mx:integrate", 1)).unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        let _ = reg.publish_match(&ev("S1", "mx:integrate", 2)).unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(reg.evict_idle(Instant::now(), grace), 0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(reg.evict_idle(Instant::now(), grace), 2);
        assert_eq!(reg.key_count(), 0);
    }

    #[test]
    fn slow_subscriber_does_not_hold_back_others() {
        let reg = Registry::default();
        let key = SubscriptionKey::new("S1", "mx:integrate");
        let slow = Arc::new(Subscriber::new(ConnectionId::new(), 2, Arc::new(Notify::new())));
        let fast = Arc::new(Subscriber::new(ConnectionId::new(), 100, Arc::new(Notify::new())));
        let _ = reg.subscribe(key.clone(), Arc::clone(&slow));
        let _ = reg.subscribe(key, Arc::clone(&fast));

        for seq in 1..=10 {
            let delivered = reg.publish_match(&ev("S1", "mx:integrate", seq)).unwrap();
            assert_eq!(delivered.len(), 2);
        }

        let fast_out = fast.drain(usize::MAX);
        assert!(fast_out.iter().all(|o| matches!(o, Outbound::Event(_))));
        assert_eq!(
            fast_out
                .iter()
                .filter_map(|o| match o {
                    Outbound::Event(e) => Some(e.sequence),
                    Outbound::Gap { .. } => None,
                })
                .collect::<Vec<_>>(),
            (1..=10).collect::<Vec<u64>>()
        );

        assert_eq!(slow.pop(), Some(Outbound::Gap { missed: 9 }));
        assert_matches!(slow.pop(), Some(Outbound::Event(e)) if e.sequence == 10);
        assert_eq!(slow.pop(), None);
    }

    #[test]
    fn resubscribe_clears_idle_state() {
        let reg = Registry::default();
        let key = SubscriptionKey::new("S1", "mx:integrate");
        let _ = reg.publish_match(&ev("S1", "mx:integrate", 1)).unwrap();
        let _ = reg.subscribe(key.clone(), sub());
        let far_future = Instant::now() + Duration::from_secs(10_000);
        assert_eq!(reg.evict_idle(far_future, Duration::from_secs(1)), 1);
        assert!(reg.contains_key(&key));
    }

    #[test]
    fn concurrent_subscribe_never_duplicates_or_misses() {
        let reg = Arc::new(Registry::new(RegistryConfig {
            replay_capacity: 1_000,
            buffer_unclaimed: true,
        }));
        let publisher = {
            let reg = Arc::clone(&reg);
            std::thread::spawn(move || {
                for seq in 1..=500 {
                    let _ = reg.publish_match(&ev("S1", "mx:integrate", seq)).unwrap();
                }
            })
        };
        let mut subs = Vec::new();
        for _ in 0..20 {
            let s = Arc::new(Subscriber::new(ConnectionId::new(), 1_000, Arc::new(Notify::new())));
            let snapshot = reg.subscribe(SubscriptionKey::new("S1", "mx:integrate"), Arc::clone(&s));
            subs.push((snapshot, s));
        }
        publisher.join().unwrap();

        for (snapshot, s) in subs {
            let mut all = seqs(&snapshot);
            all.extend(queued(&s));
            let expected: Vec<u64> = (1..=500).collect();
            assert_eq!(all, expected);
        }
    }
}
