//! Backoff configuration and delay calculation.
//!
//! Sync-only building blocks; the async reconnect loops that use them live in
//! the crates that own the connections.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Exponential backoff parameters. Attempts are unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    /// Delay before the first retry, in ms.
    pub base_delay_ms: u64,
    /// Upper bound on any delay, in ms.
    pub max_delay_ms: u64,
    /// Symmetric jitter as a fraction of the delay.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffConfig {
    /// Delay for the given zero-based attempt, using `random` in `[0.0, 1.0)`.
    pub fn delay(&self, attempt: u32, random: f64) -> Duration {
        Duration::from_millis(calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            random,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Exponential backoff `base * 2^attempt`, capped, with symmetric jitter.
///
/// `random` maps `[0, 1)` onto `[-jitter, +jitter]`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);

    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor;
    let with_jitter = (capped as f64) * jitter;

    with_jitter.round().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_random_has_no_jitter() {
        assert_eq!(calculate_backoff_delay_with_random(0, 500, 30_000, 0.2, 0.5), 500);
        assert_eq!(calculate_backoff_delay_with_random(3, 500, 30_000, 0.2, 0.5), 4000);
    }

    #[test]
    fn capped_at_max() {
        assert_eq!(calculate_backoff_delay_with_random(20, 500, 30_000, 0.0, 0.9), 30_000);
    }

    #[test]
    fn jitter_bounds() {
        let low = calculate_backoff_delay_with_random(1, 500, 30_000, 0.2, 0.0);
        let high = calculate_backoff_delay_with_random(1, 500, 30_000, 0.2, 0.999_999);
        assert_eq!(low, 800);
        assert_eq!(high, 1200);
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        assert_eq!(calculate_backoff_delay_with_random(u32::MAX, 500, 30_000, 0.0, 0.5), 30_000);
    }

    #[test]
    fn config_defaults() {
        let cfg = BackoffConfig::default();
        assert_eq!(cfg.base_delay_ms, 500);
        assert_eq!(cfg.max_delay_ms, 30_000);
        assert_eq!(cfg.delay(0, 0.5), Duration::from_millis(500));
    }

    #[test]
    fn config_partial_json_uses_defaults() {
        let cfg: BackoffConfig = serde_json::from_str(r#"{"baseDelayMs": 100}"#).unwrap();
        assert_eq!(cfg.base_delay_ms, 100);
        assert_eq!(cfg.max_delay_ms, 30_000);
    }
}
