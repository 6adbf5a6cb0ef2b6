//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// The settings file or merged document is not valid for [`crate::RelaySettings`].
    #[error("settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value is out of range or inconsistent with another value.
    #[error("invalid setting `{key}`: {reason}")]
    InvalidValue {
        /// Dotted path of the offending key.
        key: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

impl SettingsError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key,
            reason: reason.into(),
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
