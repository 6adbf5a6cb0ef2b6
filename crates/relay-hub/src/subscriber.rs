//! Per-subscription outbound queue.
//!
//! Bounded, and pushing never blocks. When full, the oldest entries are
//! dropped and collapsed into a single [`Outbound::Gap`] at the head that
//! counts what was lost. Every push wakes the owning connection through a
//! shared [`Notify`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use relay_core::{ConnectionId, Event, SubscriptionId};
use tokio::sync::Notify;

/// Smallest accepted queue bound: one gap marker plus one item.
pub const MIN_QUEUE_CAPACITY: usize = 2;

/// An item waiting to be written to the client.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// A live event.
    Event(Arc<Event>),
    /// Events were lost before this point.
    Gap {
        /// How many events were dropped (0 when unknown, e.g. a bus outage).
        missed: u64,
    },
}

/// Result of a push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without loss.
    Queued,
    /// Queued after dropping older entries.
    Overflowed {
        /// True on the first overflow since the queue last drained.
        first: bool,
        /// Events dropped by this push.
        dropped: u64,
    },
    /// The subscriber was closed; nothing queued.
    Closed,
}

struct QueueState {
    items: VecDeque<Outbound>,
    closed: bool,
    overflowing: bool,
}

/// One registration of a connection on a subscription key.
pub struct Subscriber {
    id: SubscriptionId,
    connection_id: ConnectionId,
    capacity: usize,
    state: Mutex<QueueState>,
    waker: Arc<Notify>,
    dropped_total: AtomicU64,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Create a subscriber with a fresh id.
    pub fn new(connection_id: ConnectionId, capacity: usize, waker: Arc<Notify>) -> Self {
        Self::with_id(SubscriptionId::new(), connection_id, capacity, waker)
    }

    /// Create a subscriber with a known id.
    pub fn with_id(
        id: SubscriptionId,
        connection_id: ConnectionId,
        capacity: usize,
        waker: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            connection_id,
            capacity: capacity.max(MIN_QUEUE_CAPACITY),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                overflowing: false,
            }),
            waker,
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Subscription id.
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Owning connection.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Queue a live event.
    pub fn push_event(&self, event: Arc<Event>) -> PushOutcome {
        self.push(Outbound::Event(event))
    }

    /// Queue a gap marker (merged into a trailing marker if present).
    pub fn push_gap(&self) -> PushOutcome {
        self.push(Outbound::Gap { missed: 0 })
    }

    fn push(&self, item: Outbound) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if let (Outbound::Gap { missed: extra }, Some(Outbound::Gap { missed })) =
                (&item, state.items.back_mut())
            {
                *missed += extra;
                PushOutcome::Queued
            } else if state.items.len() < self.capacity {
                state.items.push_back(item);
                PushOutcome::Queued
            } else {
                let dropped = Self::make_room(&mut state.items, self.capacity);
                state.items.push_back(item);
                let first = !state.overflowing;
                state.overflowing = true;
                let _ = self.dropped_total.fetch_add(dropped, Ordering::Relaxed);
                PushOutcome::Overflowed { first, dropped }
            }
        };
        self.waker.notify_one();
        outcome
    }

    /// Drop from the head until one marker plus the new item fit. Returns
    /// the number of events dropped.
    fn make_room(items: &mut VecDeque<Outbound>, capacity: usize) -> u64 {
        let mut missed = 0;
        let mut dropped = 0;
        while items.len() + 2 > capacity {
            match items.pop_front() {
                Some(Outbound::Event(_)) => {
                    missed += 1;
                    dropped += 1;
                }
                Some(Outbound::Gap { missed: m }) => missed += m,
                None => break,
            }
        }
        if let Some(Outbound::Gap { missed: m }) = items.front() {
            missed += m;
            let _ = items.pop_front();
        }
        items.push_front(Outbound::Gap { missed });
        dropped
    }

    /// Take the next queued item.
    pub fn pop(&self) -> Option<Outbound> {
        let mut state = self.state.lock();
        let item = state.items.pop_front();
        if state.items.is_empty() {
            state.overflowing = false;
        }
        item
    }

    /// Take up to `max` queued items in order.
    pub fn drain(&self, max: usize) -> Vec<Outbound> {
        let mut state = self.state.lock();
        let n = max.min(state.items.len());
        let batch: Vec<Outbound> = state.items.drain(..n).collect();
        if state.items.is_empty() {
            state.overflowing = false;
        }
        batch
    }

    /// Stop accepting items and discard anything queued.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.items.clear();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Queued items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped over this subscriber's lifetime.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use relay_core::{Category, ResultType, SessionId};

    fn ev(sequence: u64) -> Arc<Event> {
        Arc::new(Event {
            category: Category::ResultAdded,
            session_id: SessionId::new("S1"),
            result_type: ResultType::new("mx:integrate"),
            payload: serde_json::Value::Null,
            sequence,
            channel: String::new(),
        })
    }

    fn sub(capacity: usize) -> Subscriber {
        Subscriber::new(ConnectionId::new(), capacity, Arc::new(Notify::new()))
    }

    fn sequences(items: &[Outbound]) -> Vec<Option<u64>> {
        items
            .iter()
            .map(|i| match i {
                Outbound::Event(e) => Some(e.sequence),
                Outbound::Gap { .. } => None,
            })
            .collect()
    }

    #[test]
    fn fifo_under_capacity() {
        let s = sub(4);
        for seq in 1..=3 {
            assert_eq!(s.push_event(ev(seq)), PushOutcome::Queued);
        }
        assert_eq!(sequences(&s.drain(10)), vec![Some(1), Some(2), Some(3)]);
        assert!(s.is_empty());
    }

    #[test]
    fn overflow_replaces_oldest_with_gap() {
        let s = sub(3);
        for seq in 1..=3 {
            let _ = s.push_event(ev(seq));
        }
        assert_eq!(
            s.push_event(ev(4)),
            PushOutcome::Overflowed { first: true, dropped: 2 }
        );
        let items = s.drain(10);
        assert_eq!(items[0], Outbound::Gap { missed: 2 });
        assert_eq!(sequences(&items[1..]), vec![Some(3), Some(4)]);
        assert_eq!(s.dropped_total(), 2);
    }

    #[test]
    fn consecutive_overflows_merge_into_one_gap() {
        let s = sub(3);
        for seq in 1..=6 {
            let _ = s.push_event(ev(seq));
        }
        let items = s.drain(10);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Outbound::Gap { missed: 4 });
        assert_eq!(sequences(&items[1..]), vec![Some(5), Some(6)]);
    }

    #[test]
    fn first_flag_resets_after_drain() {
        let s = sub(2);
        let _ = s.push_event(ev(1));
        let _ = s.push_event(ev(2));
        assert!(matches!(s.push_event(ev(3)), PushOutcome::Overflowed { first: true, .. }));
        assert!(matches!(s.push_event(ev(4)), PushOutcome::Overflowed { first: false, .. }));
        let _ = s.drain(10);
        let _ = s.push_event(ev(5));
        let _ = s.push_event(ev(6));
        assert!(matches!(s.push_event(ev(7)), PushOutcome::Overflowed { first: true, .. }));
    }

    #[test]
    fn trailing_gaps_merge() {
        let s = sub(4);
        let _ = s.push_event(ev(1));
        let _ = s.push_gap();
        let _ = s.push_gap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.pop(), Some(Outbound::Event(ev(1))));
        assert_eq!(s.pop(), Some(Outbound::Gap { missed: 0 }));
    }

    #[test]
    fn closed_subscriber_rejects() {
        let s = sub(4);
        let _ = s.push_event(ev(1));
        s.close();
        assert!(s.is_closed());
        assert!(s.is_empty());
        assert_eq!(s.push_event(ev(2)), PushOutcome::Closed);
    }

    #[tokio::test]
    async fn push_wakes_waiter() {
        let waker = Arc::new(Notify::new());
        let s = Subscriber::new(ConnectionId::new(), 4, waker.clone());
        let _ = s.push_event(ev(1));
        tokio::time::timeout(std::time::Duration::from_secs(1), waker.notified())
            .await
            .unwrap();
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity_and_keeps_order(capacity in 2usize..12, count in 0u64..60) {
            let s = sub(capacity);
            for seq in 1..=count {
                let _ = s.push_event(ev(seq));
                prop_assert!(s.len() <= capacity);
            }
            let items = s.drain(usize::MAX);
            let seqs: Vec<u64> = sequences(&items).into_iter().flatten().collect();
            prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            let missed: u64 = items.iter().map(|i| match i {
                Outbound::Gap { missed } => *missed,
                Outbound::Event(_) => 0,
            }).sum();
            prop_assert_eq!(missed + seqs.len() as u64, count);
            prop_assert_eq!(missed, s.dropped_total());
        }
    }
}
