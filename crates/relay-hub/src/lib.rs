//! # relay-hub
//!
//! The in-process core of the relay: bus payloads come in through one
//! [`Ingestor`] per channel, are sequenced by a shared [`EventSink`], and a
//! single [`Dispatcher`] routes them into the [`Registry`], which holds a
//! [`ReplayBuffer`] and the live [`Subscriber`] queues for every key.
//!
//! [`start`] wires all of this up and returns a [`HubHandle`].

#![deny(unsafe_code)]

pub mod decode;
pub mod dispatcher;
pub mod ingestor;
pub mod registry;
pub mod replay;
pub mod sink;
pub mod subscriber;
pub mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use relay_bus::MessageBus;
use relay_core::RelayError;
use relay_core::retry::BackoffConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use decode::{EventDraft, decode};
pub use dispatcher::Dispatcher;
pub use ingestor::Ingestor;
pub use registry::{Registry, RegistryConfig};
pub use replay::{DEFAULT_REPLAY_CAPACITY, ReplayBuffer};
pub use sink::{DispatcherGone, EventSink, Ingested, event_channel};
pub use subscriber::{MIN_QUEUE_CAPACITY, Outbound, PushOutcome, Subscriber};
pub use sweeper::run_sweeper;

/// Hub wiring parameters.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Bus channels to ingest.
    pub channels: Vec<String>,
    /// Bound of the ingest → dispatcher queue.
    pub ingest_buffer: usize,
    /// Reconnect backoff for ingestors.
    pub backoff: BackoffConfig,
    /// Replay and unclaimed-buffering policy.
    pub registry: RegistryConfig,
    /// How long an unsubscribed key keeps its buffer.
    pub grace_period: Duration,
    /// How often idle keys are swept.
    pub sweep_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channels: vec!["RAPD_RESULTS".to_owned()],
            ingest_buffer: 1024,
            backoff: BackoffConfig::default(),
            registry: RegistryConfig::default(),
            grace_period: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Running hub tasks.
pub struct HubHandle {
    /// Shared registry, for the gateway.
    pub registry: Arc<Registry>,
    /// Dispatcher task. Resolves to an error only on an invariant violation.
    pub dispatcher: JoinHandle<Result<(), RelayError>>,
    /// Ingestor and sweeper tasks.
    pub tasks: Vec<JoinHandle<()>>,
}

/// Spawn the ingestors, dispatcher and sweeper. Everything stops when
/// `cancel` fires.
pub fn start(bus: Arc<dyn MessageBus>, config: HubConfig, cancel: &CancellationToken) -> HubHandle {
    let registry = Arc::new(Registry::new(config.registry));
    let (sink, rx) = event_channel(config.ingest_buffer);

    let dispatcher = tokio::spawn(Dispatcher::new(Arc::clone(&registry), rx).run(cancel.clone()));

    let mut tasks: Vec<JoinHandle<()>> = config
        .channels
        .iter()
        .map(|channel| {
            let ingestor = Ingestor::new(Arc::clone(&bus), channel.clone(), sink.clone(), config.backoff);
            tokio::spawn(ingestor.run(cancel.clone()))
        })
        .collect();
    tasks.push(tokio::spawn(run_sweeper(
        Arc::clone(&registry),
        config.sweep_interval,
        config.grace_period,
        cancel.clone(),
    )));

    info!(
        channels = ?config.channels,
        replay_capacity = config.registry.replay_capacity,
        buffer_unclaimed = config.registry.buffer_unclaimed,
        "hub started"
    );
    HubHandle {
        registry,
        dispatcher,
        tasks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use relay_bus::InMemoryBus;
    use relay_core::SubscriptionKey;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn end_to_end_through_memory_bus() {
        let bus = Arc::new(InMemoryBus::new());
        let cancel = CancellationToken::new();
        let hub = start(bus.clone(), HubConfig::default(), &cancel);

        let waker = Arc::new(Notify::new());
        let sub = Arc::new(Subscriber::new(relay_core::ConnectionId::new(), 8, Arc::clone(&waker)));
        let _ = hub
            .registry
            .subscribe(SubscriptionKey::new("S1", "mx:integrate"), Arc::clone(&sub));

        while bus.subscriber_count("RAPD_RESULTS") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let payload = serde_json::json!({
            "msg_type": "results",
            "results": [{"session_id": "S1", "result_type": "mx:integrate"}]
        });
        let _ = bus
            .publish("RAPD_RESULTS", Bytes::from(serde_json::to_vec(&payload).unwrap()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), waker.notified())
            .await
            .unwrap();
        assert!(matches!(sub.pop(), Some(Outbound::Event(e)) if e.sequence == 1));

        cancel.cancel();
        assert!(hub.dispatcher.await.unwrap().is_ok());
        for task in hub.tasks {
            task.await.unwrap();
        }
    }
}
