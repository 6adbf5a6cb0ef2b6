//! # relay-bus
//!
//! The relay's view of the upstream message bus, split into three narrow
//! interfaces:
//!
//! - [`MessageBus`]: channel pub/sub that the ingestors consume
//! - [`WorkQueue`]: job submission (`LPUSH`), returning the queue length
//! - [`PresenceStore`]: expiring keys advertising live gateway instances
//!
//! Two backends implement all three: [`InMemoryBus`] for tests and
//! single-process setups, and [`RedisBus`] speaking RESP2 over TCP.

#![deny(unsafe_code)]

pub mod bus;
pub mod error;
pub mod memory;
pub mod redis;
pub mod resp;

use std::sync::Arc;
use std::time::Duration;

pub use bus::{BusStream, MessageBus, PresenceStore, RawMessage, WorkQueue};
pub use error::BusError;
pub use memory::InMemoryBus;
pub use redis::{RedisBus, RedisConfig};

/// Handles onto one backend through each of its interfaces.
#[derive(Clone)]
pub struct BusClients {
    /// Pub/sub.
    pub messages: Arc<dyn MessageBus>,
    /// Job submission.
    pub jobs: Arc<dyn WorkQueue>,
    /// Presence keys.
    pub presence: Arc<dyn PresenceStore>,
}

impl BusClients {
    /// Wrap a backend that implements every interface.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: MessageBus + WorkQueue + PresenceStore + 'static,
    {
        Self {
            messages: backend.clone(),
            jobs: backend.clone(),
            presence: backend,
        }
    }
}

/// Open the backend named by `url`.
///
/// `memory://` creates a fresh in-process bus; `redis://` configures a lazy
/// Redis client (connections are made on first use).
pub fn open(url: &str, connect_timeout: Duration) -> Result<BusClients, BusError> {
    if url.starts_with("memory://") {
        return Ok(BusClients::from_backend(Arc::new(InMemoryBus::new())));
    }
    let config = RedisConfig::from_url(url)?.with_connect_timeout(connect_timeout);
    Ok(BusClients::from_backend(Arc::new(RedisBus::new(config))))
}
