//! Sequencing hand-off from ingestors to the dispatcher.
//!
//! All ingestors share one [`EventSink`]. Sequence assignment and enqueueing
//! happen under the same lock, so the dispatcher receives events in strictly
//! increasing sequence order even with several channels feeding it.

use std::sync::Arc;

use relay_core::Event;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use crate::decode::EventDraft;

/// Items flowing into the dispatcher.
#[derive(Debug)]
pub enum Ingested {
    /// A sequenced event.
    Event(Event),
    /// The channel reconnected; anything published during the outage is lost.
    Resync {
        /// Channel that reconnected.
        channel: String,
    },
}

/// The dispatcher has stopped receiving.
#[derive(Debug, Error)]
#[error("dispatcher stopped")]
pub struct DispatcherGone;

struct SinkState {
    next_sequence: u64,
    tx: mpsc::Sender<Ingested>,
}

/// Cloneable sequencing sender.
#[derive(Clone)]
pub struct EventSink {
    state: Arc<Mutex<SinkState>>,
}

/// Create a sink and the dispatcher's receiving end. Sequences start at 1.
pub fn event_channel(capacity: usize) -> (EventSink, mpsc::Receiver<Ingested>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = EventSink {
        state: Arc::new(Mutex::new(SinkState {
            next_sequence: 1,
            tx,
        })),
    };
    (sink, rx)
}

impl EventSink {
    /// Sequence and enqueue drafts in order. Waits while the dispatcher queue
    /// is full. Returns the last sequence assigned.
    pub async fn emit(&self, channel: &str, drafts: Vec<EventDraft>) -> Result<u64, DispatcherGone> {
        let mut state = self.state.lock().await;
        let mut last = state.next_sequence.saturating_sub(1);
        for draft in drafts {
            let sequence = state.next_sequence;
            state
                .tx
                .send(Ingested::Event(draft.into_event(sequence, channel)))
                .await
                .map_err(|_| DispatcherGone)?;
            state.next_sequence += 1;
            last = sequence;
        }
        Ok(last)
    }

    /// Announce that `channel` reconnected after an outage.
    pub async fn resync(&self, channel: &str) -> Result<(), DispatcherGone> {
        let state = self.state.lock().await;
        state
            .tx
            .send(Ingested::Resync {
                channel: channel.to_owned(),
            })
            .await
            .map_err(|_| DispatcherGone)
    }
}
