//! Presence keys advertising this gateway instance and its connections.
//!
//! Every tick writes `R2:WSS:<instance>` = host, and for each connection
//! following at least one session `R2:WSC:<connection>` = the comma-joined
//! session ids. Keys expire after the TTL, so a dead instance disappears on
//! its own.

use std::sync::Arc;
use std::time::Duration;

use relay_bus::PresenceStore;
use relay_core::InstanceId;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::{Connection, Gateway};

/// Key prefix for gateway instances.
pub const INSTANCE_PREFIX: &str = "R2:WSS:";
/// Key prefix for client connections.
pub const CONNECTION_PREFIX: &str = "R2:WSC:";

/// Keys and values to publish for one tick.
pub fn presence_entries(instance: &InstanceId, host: &str, connections: &[Arc<Connection>]) -> Vec<(String, String)> {
    let mut entries = vec![(format!("{INSTANCE_PREFIX}{instance}"), host.to_owned())];
    for conn in connections {
        let sessions = conn.session_ids();
        if sessions.is_empty() {
            continue;
        }
        entries.push((format!("{CONNECTION_PREFIX}{}", conn.id), sessions.join(",")));
    }
    entries
}

/// Refresh presence keys every `interval` until cancelled.
pub async fn run_presence(
    store: Arc<dyn PresenceStore>,
    gateway: Arc<Gateway>,
    instance: InstanceId,
    interval: Duration,
    cancel: CancellationToken,
) {
    let ttl = gateway.config().presence_ttl;
    let host = gateway.config().instance_host.clone();
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let entries = presence_entries(&instance, &host, &gateway.connections());
                for (key, value) in &entries {
                    if let Err(e) = store.set_expiring(key, value, ttl).await {
                        warn!(key = %key, error = %e, "presence update failed");
                        break;
                    }
                }
                debug!(%instance, keys = entries.len(), "presence refreshed");
            }
        }
    }
}
