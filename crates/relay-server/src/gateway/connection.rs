//! Per-connection state shared between the reader, writer and heartbeat.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::{ConnectionId, SubscriptionId, SubscriptionKey};
use relay_hub::Subscriber;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Identity;

/// Lifecycle of a gateway connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgraded, not yet authenticated.
    Connecting,
    /// Identity established.
    Authenticated,
    /// Accepting control frames and delivering events.
    Active,
    /// Tearing down.
    Closing,
    /// Gone; every subscription has been released.
    Closed,
}

impl ConnectionState {
    fn can_become(self, next: Self) -> bool {
        use ConnectionState::{Active, Authenticated, Closed, Closing, Connecting};
        matches!(
            (self, next),
            (Connecting, Authenticated | Closing | Closed)
                | (Authenticated, Active | Closing)
                | (Active | Closing, Closing | Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// The subscription already exists on this connection.
#[derive(Debug)]
pub struct DuplicateKey;

/// A live WebSocket client.
pub struct Connection {
    /// Unique connection id.
    pub id: ConnectionId,
    state: Mutex<ConnectionState>,
    identity: Mutex<Identity>,
    is_alive: AtomicBool,
    last_activity: Mutex<Instant>,
    subscriptions: Mutex<HashMap<SubscriptionId, (SubscriptionKey, Arc<Subscriber>)>>,
    waker: Arc<Notify>,
    cancel: CancellationToken,
    connected_at: Instant,
}

impl Connection {
    /// New connection in `Connecting`, cancelled together with `cancel`.
    pub fn new(id: ConnectionId, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: Mutex::new(ConnectionState::Connecting),
            identity: Mutex::new(Identity::anonymous()),
            is_alive: AtomicBool::new(true),
            last_activity: Mutex::new(now),
            subscriptions: Mutex::new(HashMap::new()),
            waker: Arc::new(Notify::new()),
            cancel,
            connected_at: now,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `next`. Invalid transitions are refused and logged.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        let prev = *state;
        if prev == next {
            return true;
        }
        if !prev.can_become(next) {
            warn!(conn_id = %self.id, from = %prev, to = %next, "refused connection state transition");
            return false;
        }
        *state = next;
        info!(conn_id = %self.id, from = %prev, to = %next, "connection state changed");
        true
    }

    /// Record the authenticated identity.
    pub fn set_identity(&self, identity: Identity) {
        *self.identity.lock() = identity;
    }

    /// Authenticated identity.
    pub fn identity(&self) -> Identity {
        self.identity.lock().clone()
    }

    /// Note inbound traffic (any frame, including pongs).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Check and reset the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Wakes this connection's writer when any of its queues gain items.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.waker)
    }

    /// Cancellation scope for this connection's tasks.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether this connection already follows `key`.
    pub fn follows(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions.lock().values().any(|(k, _)| k == key)
    }

    /// Record a subscription owned by this connection.
    pub fn add_subscription(&self, key: SubscriptionKey, subscriber: Arc<Subscriber>) -> Result<(), DuplicateKey> {
        let mut subs = self.subscriptions.lock();
        if subs.values().any(|(k, _)| *k == key) {
            return Err(DuplicateKey);
        }
        let _ = subs.insert(subscriber.id().clone(), (key, subscriber));
        Ok(())
    }

    /// Forget a subscription, returning its key.
    pub fn remove_subscription(&self, id: &SubscriptionId) -> Option<(SubscriptionKey, Arc<Subscriber>)> {
        self.subscriptions.lock().remove(id)
    }

    /// Forget every subscription.
    pub fn take_subscriptions(&self) -> Vec<(SubscriptionKey, Arc<Subscriber>)> {
        let taken: Vec<_> = self.subscriptions.lock().drain().map(|(_, v)| v).collect();
        debug!(conn_id = %self.id, count = taken.len(), "released connection subscriptions");
        taken
    }

    /// Number of subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Distinct sessions this connection follows, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .subscriptions
            .lock()
            .values()
            .map(|(k, _)| k.session_id.as_str().to_owned())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new(ConnectionId::new(), CancellationToken::new())
    }

    fn sub(c: &Connection) -> Arc<Subscriber> {
        Arc::new(Subscriber::new(c.id.clone(), 4, c.waker()))
    }

    #[test]
    fn lifecycle() {
        let c = conn();
        assert_eq!(c.state(), ConnectionState::Connecting);
        assert!(!c.transition(ConnectionState::Active));
        assert!(c.transition(ConnectionState::Authenticated));
        assert!(c.transition(ConnectionState::Active));
        assert!(c.transition(ConnectionState::Closing));
        assert!(c.transition(ConnectionState::Closed));
        assert!(!c.transition(ConnectionState::Active));
    }

    #[test]
    fn failed_auth_closes_from_connecting() {
        let c = conn();
        assert!(c.transition(ConnectionState::Closed));
    }

    #[test]
    fn subscriptions_by_key() {
        let c = conn();
        let a = sub(&c);
        let key = SubscriptionKey::new("S1", "mx:integrate");
        c.add_subscription(key.clone(), Arc::clone(&a)).unwrap();
        assert!(c.follows(&key));
        assert!(c.add_subscription(key.clone(), sub(&c)).is_err());
        c.add_subscription(SubscriptionKey::wildcard("S2"), sub(&c)).unwrap();
        c.add_subscription(SubscriptionKey::wildcard("S1"), sub(&c)).unwrap();
        assert_eq!(c.session_ids(), vec!["S1".to_owned(), "S2".to_owned()]);

        let (removed, _) = c.remove_subscription(a.id()).unwrap();
        assert_eq!(removed, key);
        assert!(c.remove_subscription(a.id()).is_none());
        assert_eq!(c.take_subscriptions().len(), 2);
        assert_eq!(c.subscription_count(), 0);
    }

    #[test]
    fn alive_flag_swaps() {
        let c = conn();
        assert!(c.check_alive());
        assert!(!c.check_alive());
        c.mark_alive();
        assert!(c.check_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_resets_on_activity() {
        let c = conn();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(c.idle_for() >= Duration::from_secs(10));
        c.mark_alive();
        assert!(c.idle_for() < Duration::from_secs(1));
    }
}
