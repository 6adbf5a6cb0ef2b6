//! Bus error types.

use relay_core::RelayError;
use thiserror::Error;

/// Errors from bus backends.
#[derive(Debug, Error)]
pub enum BusError {
    /// The backend is not reachable.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    /// Connecting timed out.
    #[error("connect to {addr} timed out")]
    ConnectTimeout {
        /// Target address.
        addr: String,
    },
    /// Socket-level failure.
    #[error("bus io: {0}")]
    Io(#[from] std::io::Error),
    /// The peer closed the connection.
    #[error("bus connection closed")]
    Closed,
    /// Bytes on the wire were not valid RESP.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),
    /// The reply had an unexpected shape.
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply {
        /// Command sent.
        command: &'static str,
        /// Debug rendering of the reply.
        reply: String,
    },
    /// The bus URL could not be parsed.
    #[error("invalid bus url {0:?}")]
    InvalidUrl(String),
}

impl BusError {
    /// Whether the connection that produced this error must be discarded.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_)
                | Self::ConnectTimeout { .. }
                | Self::Io(_)
                | Self::Closed
                | Self::Protocol(_)
        )
    }
}

impl From<BusError> for RelayError {
    fn from(err: BusError) -> Self {
        RelayError::BusUnavailable(err.to_string())
    }
}
