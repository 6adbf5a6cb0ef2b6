//! Periodic eviction of idle replay buffers.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::Registry;

/// Every `interval`, drop keys that have had no subscribers for `grace`.
pub async fn run_sweeper(
    registry: Arc<Registry>,
    interval: Duration,
    grace: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel.cancelled() => break,
        }
        let evicted = registry.evict_idle(Instant::now(), grace);
        if evicted > 0 {
            info!(evicted, remaining = registry.key_count(), "evicted idle replay buffers");
        } else {
            debug!(keys = registry.key_count(), "sweep found nothing idle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Category, Event, ResultType, SessionId};

    #[tokio::test(start_paused = true)]
    async fn evicts_after_grace() {
        let registry = Arc::new(Registry::default());
        let _ = registry
            .publish_match(&Arc::new(Event {
                category: Category::ResultAdded,
                session_id: SessionId::new("S1"),
                result_type: ResultType::new("mx:integrate"),
                payload: serde_json::Value::Null,
                sequence: 1,
                channel: String::new(),
            }))
            .unwrap();
        assert_eq!(registry.key_count(), 2);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sweeper(
            Arc::clone(&registry),
            Duration::from_secs(30),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.key_count(), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.key_count(), 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
