//! WebSocket transport gateway: connection admission, per-connection
//! reader/writer/heartbeat tasks, and the client wire protocol.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod protocol;
pub mod writer;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use relay_core::ConnectionId;
use relay_core::metrics::WS_CONNECTIONS_ACTIVE;
use relay_hub::Registry;
use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::config::GatewayConfig;

pub use connection::{Connection, ConnectionState};
pub use handler::serve_connection;

/// Shared gateway state.
pub struct Gateway {
    registry: Arc<Registry>,
    auth: Authenticator,
    config: GatewayConfig,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Gateway over `registry`. Every connection is cancelled with `shutdown`.
    pub fn new(
        registry: Arc<Registry>,
        auth: Authenticator,
        config: GatewayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            auth,
            config,
            connections: DashMap::new(),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    /// The subscription registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Authentication policy.
    pub fn auth(&self) -> &Authenticator {
        &self.auth
    }

    /// Gateway parameters.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Reserve room for one connection, or `None` at `max_connections`.
    pub fn try_acquire_slot(&self) -> Option<ConnectionSlot> {
        let max = self.config.max_connections;
        let acquired = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;
        metrics::gauge!(WS_CONNECTIONS_ACTIVE).set(acquired as f64 + 1.0);
        Some(ConnectionSlot {
            active: Arc::clone(&self.active),
        })
    }

    /// Whether shutdown has started.
    pub fn is_draining(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Open connections, including ones still authenticating.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Snapshot of the active connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Token for a new connection's tasks.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub(crate) fn insert(&self, connection: Arc<Connection>) {
        let _ = self.connections.insert(connection.id.clone(), connection);
    }

    pub(crate) fn remove(&self, id: &ConnectionId) {
        let _ = self.connections.remove(id);
    }
}

/// A reserved connection slot, released on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        metrics::gauge!(WS_CONNECTIONS_ACTIVE).set(prev.saturating_sub(1) as f64);
    }
}
