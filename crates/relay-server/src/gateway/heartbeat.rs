//! Idle detection for gateway connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::connection::Connection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Nothing arrived from the client within the timeout.
    TimedOut,
    /// The connection was cancelled.
    Cancelled,
}

/// Watch a connection until it has been silent for `timeout`.
///
/// Checks happen every `interval`; the writer sends the pings that give the
/// client something to answer.
pub async fn run_heartbeat(
    connection: Arc<Connection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let idle = connection.idle_for();
                trace!(conn_id = %connection.id, ?idle, "heartbeat check");
                if idle >= timeout {
                    return HeartbeatResult::TimedOut;
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
