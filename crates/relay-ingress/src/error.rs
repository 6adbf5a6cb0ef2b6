//! Router setup errors. Per-request upstream failures never surface here;
//! they become `502` responses.

use thiserror::Error;

/// Failure to start the router.
#[derive(Debug, Error)]
pub enum IngressError {
    /// The listener could not be bound.
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
    /// The upstream HTTP client could not be built.
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}
