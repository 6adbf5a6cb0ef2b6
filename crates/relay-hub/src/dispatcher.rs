//! Single-consumer fan-out from the ingest stream into the registry.

use std::sync::Arc;

use relay_core::{Event, RelayError};
use relay_core::metrics::{EVENTS_DISPATCHED_TOTAL, EVENTS_UNMATCHED_TOTAL, GAP_MARKERS_TOTAL};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, trace, warn};

use crate::registry::Registry;
use crate::sink::Ingested;

/// Consumes sequenced events in order and routes them to subscribers.
pub struct Dispatcher {
    registry: Arc<Registry>,
    rx: mpsc::Receiver<Ingested>,
}

impl Dispatcher {
    /// Create a dispatcher reading from `rx`.
    pub fn new(registry: Arc<Registry>, rx: mpsc::Receiver<Ingested>) -> Self {
        Self { registry, rx }
    }

    /// Run until cancelled or every ingestor is gone.
    ///
    /// Returns an error only for a registry invariant violation, which means
    /// ordering is broken and the process should not keep serving.
    #[instrument(skip_all, name = "dispatcher")]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), RelayError> {
        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                item = self.rx.recv() => item,
            };
            match item {
                Some(Ingested::Event(event)) => self.dispatch(event)?,
                Some(Ingested::Resync { channel }) => {
                    let notified = self.registry.broadcast_gap();
                    metrics::counter!(GAP_MARKERS_TOTAL, "reason" => "bus_resync")
                        .increment(notified as u64);
                    warn!(%channel, notified, "bus reconnected, gap marker sent to all subscribers");
                }
                None => {
                    info!("ingest stream closed");
                    break;
                }
            }
        }
        info!("dispatcher stopped");
        Ok(())
    }

    fn dispatch(&self, event: Event) -> Result<(), RelayError> {
        let event = Arc::new(event);
        let delivered = match self.registry.publish_match(&event) {
            Ok(delivered) => delivered,
            Err(err) => {
                error!(
                    sequence = event.sequence,
                    key = %event.key(),
                    error = %err,
                    "registry rejected event"
                );
                return Err(err);
            }
        };

        if delivered.is_empty() {
            metrics::counter!(EVENTS_UNMATCHED_TOTAL).increment(1);
        } else {
            metrics::counter!(
                EVENTS_DISPATCHED_TOTAL,
                "result_kind" => event.result_type.metric_label()
            )
            .increment(1);
        }
        trace!(
            sequence = event.sequence,
            session_id = %event.session_id,
            result_type = %event.result_type,
            subscribers = delivered.len(),
            "event dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::EventDraft;
    use crate::registry::RegistryConfig;
    use crate::sink::event_channel;
    use crate::subscriber::{Outbound, Subscriber};
    use assert_matches::assert_matches;
    use relay_core::{Category, ConnectionId, ResultType, SessionId, SubscriptionKey};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn draft(rt: &str) -> EventDraft {
        EventDraft {
            category: Category::ResultAdded,
            session_id: SessionId::new("S1"),
            result_type: ResultType::new(rt),
            payload: serde_json::Value::Null,
        }
    }

    fn subscribe(registry: &Registry, key: SubscriptionKey) -> (Arc<Subscriber>, Arc<Notify>) {
        let waker = Arc::new(Notify::new());
        let sub = Arc::new(Subscriber::new(ConnectionId::new(), 8, Arc::clone(&waker)));
        let _ = registry.subscribe(key, Arc::clone(&sub));
        (sub, waker)
    }

    #[tokio::test]
    async fn routes_events_to_subscribers() {
        let registry = Arc::new(Registry::default());
        let (sub, waker) = subscribe(&registry, SubscriptionKey::new("S1", "mx:integrate"));
        let (sink, rx) = event_channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Dispatcher::new(Arc::clone(&registry), rx).run(cancel.clone()));

        let _ = sink.emit("RAPD_RESULTS", vec![draft("mx:integrate")]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waker.notified())
            .await
            .unwrap();
        assert_matches!(sub.pop(), Some(Outbound::Event(e)) if e.sequence == 1);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn resync_sends_gap_markers() {
        let registry = Arc::new(Registry::default());
        let (sub, waker) = subscribe(&registry, SubscriptionKey::wildcard("S1"));
        let (sink, rx) = event_channel(8);
        let task = tokio::spawn(Dispatcher::new(Arc::clone(&registry), rx).run(CancellationToken::new()));

        sink.resync("RAPD_RESULTS").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waker.notified())
            .await
            .unwrap();
        assert_eq!(sub.pop(), Some(Outbound::Gap { missed: 0 }));

        drop(sink);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn invariant_violation_stops_dispatcher() {
        let registry = Arc::new(Registry::new(RegistryConfig::default()));
        let _ = registry
            .publish_match(&Arc::new(draft("mx:sad").into_event(10, "X")))
            .unwrap();
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(Dispatcher::new(Arc::clone(&registry), rx).run(CancellationToken::new()));

        let stale: Event = draft("mx:sad").into_event(3, "X");
        tx.send(Ingested::Event(stale)).await.unwrap();
        assert_matches!(
            task.await.unwrap(),
            Err(RelayError::RegistryInvariantViolation(_))
        );
    }
}
