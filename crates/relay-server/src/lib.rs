//! # relay-server
//!
//! The client-facing half of the relay:
//!
//! - [`gateway`]: WebSocket upgrade, authentication, the `action`-tagged
//!   control protocol, and per-connection reader/writer/heartbeat tasks
//! - [`server`]: the axum router (`/ws`, `/health`, `/metrics`, `/snapshot`,
//!   `/jobs`, `/result-types`)
//! - [`presence`]: expiring keys announcing this instance and its clients
//! - [`shutdown`]: cancellation and graceful drain

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod presence;
pub mod server;
pub mod shutdown;

pub use auth::{Authenticator, Identity, JwtValidator, TokenValidator};
pub use config::GatewayConfig;
pub use gateway::Gateway;
pub use server::{AppState, ServerHandle, build_router, start};
pub use shutdown::{DrainReport, NamedTask, ShutdownCoordinator, wait_for_signal};
