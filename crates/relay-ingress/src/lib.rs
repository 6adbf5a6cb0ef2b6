//! # relay-ingress
//!
//! Reverse proxy in front of the relay. WebSocket upgrade requests go to the
//! transport gateway; other requests go to the REST upstream when their path
//! is under the API prefix, and to the UI upstream otherwise.
//!
//! An unreachable upstream yields a `502` for that request only. The gateway
//! connection is made before the client's upgrade is accepted, so a failed
//! upgrade is an ordinary HTTP error response.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod forward;
pub mod router;
pub mod upgrade;

pub use config::{IngressConfig, Upstream};
pub use error::IngressError;
pub use router::{IngressHandle, IngressState, build_router, start};
