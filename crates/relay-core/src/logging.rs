//! `tracing` subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level and module
//! overrides. Repeated initialization is a no-op.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Compact,
    /// One JSON object per line, with span context.
    Json,
}

/// Build the filter directive string, e.g. `info,relay_hub=debug`.
pub fn filter_directives(level: &str, module_levels: &BTreeMap<String, String>) -> String {
    let mut directives = vec![level.to_owned()];
    directives.extend(
        module_levels
            .iter()
            .map(|(module, lvl)| format!("{module}={lvl}")),
    );
    directives.join(",")
}

/// Initialize the global tracing subscriber writing to stderr.
pub fn init_subscriber(level: &str, format: LogFormat, module_levels: &BTreeMap<String, String>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(level, module_levels)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let _ = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_without_overrides() {
        assert_eq!(filter_directives("warn", &BTreeMap::new()), "warn");
    }

    #[test]
    fn directives_with_overrides() {
        let mut overrides = BTreeMap::new();
        let _ = overrides.insert("relay_hub".to_owned(), "debug".to_owned());
        let _ = overrides.insert("relay_bus".to_owned(), "trace".to_owned());
        assert_eq!(
            filter_directives("info", &overrides),
            "info,relay_bus=trace,relay_hub=debug"
        );
    }

    #[test]
    fn init_twice_is_noop() {
        init_subscriber("info", LogFormat::Compact, &BTreeMap::new());
        init_subscriber("debug", LogFormat::Json, &BTreeMap::new());
    }

    #[test]
    fn format_serde() {
        let f: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(f, LogFormat::Json);
    }
}
