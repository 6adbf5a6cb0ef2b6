//! # relay-settings
//!
//! Configuration with layered sources (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: `~/.relay/settings.json` or an explicit path, deep-merged over defaults
//! 3. **Environment variables**: `RELAY_*` overrides (highest priority)
//!
//! Loaded settings are checked with [`RelaySettings::validate`] before use.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
