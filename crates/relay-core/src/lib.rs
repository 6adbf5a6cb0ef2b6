//! # relay-core
//!
//! Shared vocabulary for the result distribution pipeline:
//!
//! - [`ids`]: branded identifiers for connections, subscriptions and instances
//! - [`event`]: the normalized [`Event`](event::Event) produced from bus messages
//! - [`result_type`]: result-type tags and the fixed [`ResultKind`](result_type::ResultKind) catalog
//! - [`subscription`]: [`SubscriptionKey`](subscription::SubscriptionKey) and wildcard matching
//! - [`errors`]: the [`RelayError`](errors::RelayError) taxonomy
//! - [`retry`]: exponential backoff math
//! - [`logging`]: `tracing` subscriber setup
//! - [`metrics`]: metric names

#![deny(unsafe_code)]

pub mod errors;
pub mod event;
pub mod ids;
pub mod logging;
pub mod metrics;
pub mod result_type;
pub mod retry;
pub mod subscription;

pub use errors::RelayError;
pub use event::{Category, Event};
pub use ids::{ConnectionId, InstanceId, SessionId, SubscriptionId};
pub use result_type::{ResultKind, ResultType, ViewClass};
pub use subscription::SubscriptionKey;
