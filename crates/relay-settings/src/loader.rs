//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use relay_core::logging::LogFormat;
use secrecy::SecretString;
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::RelaySettings;

/// Resolve the default settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load from the default path, apply env overrides and validate.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path`, apply env overrides and validate.
///
/// A missing file yields defaults; unreadable or invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = merge_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn merge_file(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RELAY_*` environment overrides.
///
/// Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    // ── Gateway ─────────────────────────────────────────────────────
    if let Some(v) = env_text("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env_number("RELAY_PORT", 0..=u16::MAX) {
        settings.server.port = v;
    }
    if let Some(v) = env_number("RELAY_MAX_CONNECTIONS", 1..=1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env_number("RELAY_QUEUE_CAPACITY", 2..=1_000_000) {
        settings.server.queue_capacity = v;
    }
    if let Some(v) = env_number("RELAY_HEARTBEAT_INTERVAL_SECS", 1..=3600) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = env_number("RELAY_HEARTBEAT_TIMEOUT_SECS", 1..=86_400) {
        settings.server.heartbeat_timeout_secs = v;
    }
    if let Some(v) = env_text("RELAY_INSTANCE_HOST") {
        settings.server.instance_host = Some(v);
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = env_flag("RELAY_AUTH_REQUIRED") {
        settings.auth.required = v;
    }
    if let Some(v) = env_text("RELAY_AUTH_SECRET") {
        settings.auth.secret = Some(SecretString::from(v));
    }

    // ── Bus ─────────────────────────────────────────────────────────
    if let Some(v) = env_text("RELAY_BUS_URL") {
        settings.bus.url = v;
    }
    if let Some(v) = env_parsed("RELAY_BUS_CHANNELS", |raw| {
        Some(parse_list(raw)).filter(|channels| !channels.is_empty())
    }) {
        settings.bus.channels = v;
    }
    if let Some(v) = env_text("RELAY_WORK_QUEUE") {
        settings.bus.work_queue = v;
    }

    // ── Replay ──────────────────────────────────────────────────────
    if let Some(v) = env_number("RELAY_REPLAY_CAPACITY", 1..=100_000) {
        settings.replay.capacity = v;
    }
    if let Some(v) = env_number("RELAY_REPLAY_GRACE_SECS", 0..=86_400) {
        settings.replay.grace_period_secs = v;
    }
    if let Some(v) = env_flag("RELAY_BUFFER_UNCLAIMED") {
        settings.replay.buffer_unclaimed = v;
    }

    // ── Proxy ───────────────────────────────────────────────────────
    if let Some(v) = env_number("RELAY_PROXY_PORT", 0..=u16::MAX) {
        settings.proxy.port = v;
    }
    if let Some(v) = env_text("RELAY_API_PREFIX") {
        settings.proxy.api_prefix = v;
    }
    if let Some(v) = env_text("RELAY_REST_UPSTREAM") {
        settings.proxy.rest_upstream = v;
    }
    if let Some(v) = env_text("RELAY_GATEWAY_UPSTREAM") {
        settings.proxy.gateway_upstream = v;
    }
    if let Some(v) = env_text("RELAY_UI_UPSTREAM") {
        settings.proxy.ui_upstream = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env_text("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env_parsed("RELAY_LOG_FORMAT", parse_log_format) {
        settings.logging.format = v;
    }
}

// ── Parsers ─────────────────────────────────────────────────────────────────

/// Parse a flag: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_flag(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a number and keep it only if it lies in `range`.
pub fn parse_in_range<T>(val: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.trim().parse().ok().filter(|n| range.contains(n))
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse `compact` (alias `text`) or `json`.
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.trim().to_ascii_lowercase().as_str() {
        "compact" | "text" => Some(LogFormat::Compact),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}

// ── Environment ─────────────────────────────────────────────────────────────

fn env_text(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Read `name` and run it through `parse`, warning when it is set but
/// unusable.
fn env_parsed<T>(name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let raw = env_text(name)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        tracing::warn!(key = name, value = %raw, "ignoring invalid environment override");
    }
    parsed
}

fn env_number<T>(name: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    env_parsed(name, |raw| parse_in_range(raw, range))
}

fn env_flag(name: &str) -> Option<bool> {
    env_parsed(name, parse_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 3100, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_replaces_arrays() {
        let target = serde_json::json!({"channels": ["A", "B"]});
        let source = serde_json::json!({"channels": ["C"]});
        assert_eq!(deep_merge(target, source)["channels"], serde_json::json!(["C"]));
    }

    #[test]
    fn merge_skips_null() {
        let target = serde_json::json!({"url": "redis://x"});
        let source = serde_json::json!({"url": null});
        assert_eq!(deep_merge(target, source)["url"], "redis://x");
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = merge_file(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s.replay.capacity, 50);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"replay": {{"capacity": 10}}, "bus": {{"channels": ["X", "Y"]}}}}"#
        )
        .unwrap();

        let s = merge_file(&path).unwrap();
        assert_eq!(s.replay.capacity, 10);
        assert_eq!(s.replay.grace_period_secs, 300);
        assert_eq!(s.bus.channels, vec!["X", "Y"]);
        assert_eq!(s.bus.work_queue, "RAPD_JOBS");
    }

    #[test]
    fn file_may_carry_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"auth": {"required": true, "secret": "s3cret"}}"#).unwrap();
        let s = merge_file(&path).unwrap();
        assert!(s.auth.required);
        assert!(s.auth.secret.is_some());
        s.validate().unwrap();
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(merge_file(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn settings_path_under_home() {
        assert!(settings_path().ends_with(".relay/settings.json"));
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn flag_values() {
        assert_eq!(parse_flag("YES"), Some(true));
        assert_eq!(parse_flag(" off "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn ranges() {
        assert_eq!(parse_in_range::<u16>("8080", 1..=u16::MAX), Some(8080));
        assert_eq!(parse_in_range::<u16>("70000", 1..=u16::MAX), None);
        assert_eq!(parse_in_range::<u64>("abc", 0..=10), None);
        assert_eq!(parse_in_range::<usize>(" 7 ", 2..=10), Some(7));
        assert_eq!(parse_in_range::<usize>("1", 2..=10), None);
    }

    #[test]
    fn list_values() {
        assert_eq!(parse_list("A, B,,C "), vec!["A", "B", "C"]);
        assert!(parse_list(" , ").is_empty());
    }

    #[test]
    fn log_format_values() {
        assert_eq!(parse_log_format("JSON"), Some(LogFormat::Json));
        assert_eq!(parse_log_format("text"), Some(LogFormat::Compact));
        assert_eq!(parse_log_format("xml"), None);
    }
}
