//! Bounded per-key history for late joiners.
//!
//! Retention is count-based: the newest `capacity` events are kept.

use std::collections::VecDeque;
use std::sync::Arc;

use relay_core::{Event, RelayError};

/// Default number of events retained per key.
pub const DEFAULT_REPLAY_CAPACITY: usize = 50;

/// Ordered ring of the most recent events for one subscription key.
#[derive(Debug)]
pub struct ReplayBuffer {
    events: VecDeque<Arc<Event>>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Create an empty buffer holding at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest event if full. Returns the evicted event.
    ///
    /// Sequences must strictly increase; anything else means events were
    /// dispatched out of order.
    pub fn append(&mut self, event: Arc<Event>) -> Result<Option<Arc<Event>>, RelayError> {
        if let Some(last) = self.last_sequence() {
            if event.sequence <= last {
                return Err(RelayError::RegistryInvariantViolation(format!(
                    "sequence {} appended after {} for {}",
                    event.sequence,
                    last,
                    event.key()
                )));
            }
        }
        let evicted = if self.events.len() == self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        Ok(evicted)
    }

    /// All retained events, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<Event>> {
        self.events.iter().cloned().collect()
    }

    /// Sequence of the newest event.
    pub fn last_sequence(&self) -> Option<u64> {
        self.events.back().map(|e| e.sequence)
    }

    /// Sequence of the oldest retained event.
    pub fn oldest_sequence(&self) -> Option<u64> {
        self.events.front().map(|e| e.sequence)
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum retained events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
