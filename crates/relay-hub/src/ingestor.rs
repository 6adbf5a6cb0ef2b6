//! Bus ingestion: one long-lived task per upstream channel.
//!
//! Each task subscribes, decodes every payload into events and hands them to
//! the shared [`EventSink`]. Malformed payloads are logged and dropped. When
//! the subscription ends the task reconnects with exponential backoff and,
//! once back, emits a resync so subscribers learn about the outage.

use std::sync::Arc;

use futures::StreamExt;
use relay_core::RelayError;
use relay_core::metrics::{BUS_RECONNECTS_TOTAL, EVENTS_INGESTED_TOTAL, EVENTS_MALFORMED_TOTAL};
use relay_core::retry::BackoffConfig;
use relay_bus::{BusStream, MessageBus, RawMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::decode::decode;
use crate::sink::{DispatcherGone, EventSink};

/// Why a subscription stopped being consumed.
enum Flow {
    Cancelled,
    DispatcherGone,
    Disconnected(String),
}

/// Ingests one channel.
pub struct Ingestor {
    bus: Arc<dyn MessageBus>,
    channel: String,
    sink: EventSink,
    backoff: BackoffConfig,
}

impl Ingestor {
    /// Create an ingestor for `channel`.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        channel: impl Into<String>,
        sink: EventSink,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            bus,
            channel: channel.into(),
            sink,
            backoff,
        }
    }

    /// Run until cancelled or until the dispatcher stops.
    #[instrument(skip_all, fields(channel = %self.channel))]
    pub async fn run(self, cancel: CancellationToken) {
        let channels = [self.channel.clone()];
        let mut attempt: u32 = 0;
        let mut connected_before = false;

        loop {
            let subscribed = tokio::select! {
                r = self.bus.subscribe(&channels) => r,
                () = cancel.cancelled() => break,
            };

            match subscribed {
                Ok(stream) => {
                    info!(attempt, "bus subscription established");
                    attempt = 0;
                    if connected_before {
                        metrics::counter!(BUS_RECONNECTS_TOTAL, "channel" => self.channel.clone())
                            .increment(1);
                        if self.sink.resync(&self.channel).await.is_err() {
                            break;
                        }
                    }
                    connected_before = true;

                    match self.consume(stream, &cancel).await {
                        Flow::Cancelled | Flow::DispatcherGone => break,
                        Flow::Disconnected(reason) => {
                            let err = RelayError::BusUnavailable(reason);
                            warn!(error = %err, "bus subscription lost");
                        }
                    }
                }
                Err(e) => {
                    let err = RelayError::from(e);
                    warn!(attempt, error = %err, "bus subscribe failed");
                }
            }

            let delay = self.backoff.delay(attempt, rand::random::<f64>());
            attempt = attempt.saturating_add(1);
            debug!(?delay, attempt, "reconnecting after backoff");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => break,
            }
        }
        info!("ingestor stopped");
    }

    async fn consume(&self, mut stream: BusStream, cancel: &CancellationToken) -> Flow {
        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                () = cancel.cancelled() => return Flow::Cancelled,
            };
            match item {
                Some(Ok(raw)) => {
                    if self.handle(raw).await.is_err() {
                        return Flow::DispatcherGone;
                    }
                }
                Some(Err(e)) => return Flow::Disconnected(e.to_string()),
                None => return Flow::Disconnected("subscription stream ended".into()),
            }
        }
    }

    async fn handle(&self, raw: RawMessage) -> Result<(), DispatcherGone> {
        match decode(&raw.payload) {
            Ok(drafts) if drafts.is_empty() => {
                debug!("payload carried no events");
                Ok(())
            }
            Ok(drafts) => {
                metrics::counter!(EVENTS_INGESTED_TOTAL, "channel" => raw.channel.clone())
                    .increment(drafts.len() as u64);
                let last = self.sink.emit(&raw.channel, drafts).await?;
                debug!(sequence = last, "events ingested");
                Ok(())
            }
            Err(err) => {
                metrics::counter!(EVENTS_MALFORMED_TOTAL, "channel" => raw.channel.clone())
                    .increment(1);
                warn!(error = %err, bytes = raw.payload.len(), "dropping malformed payload");
                Ok(())
            }
        }
    }
}
