//! Process-wide tracing setup.
//!
//! `RUST_LOG` overrides the configured level. `log` records from lower
//! layers are forwarded into tracing.

use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LoggingConfig;

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Installs the global subscriber once. Later calls are no-ops and return
/// the first outcome: `false` when another subscriber was already set.
pub fn init(config: &LoggingConfig) -> bool {
    *INSTALLED.get_or_init(|| install(config))
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn install(config: &LoggingConfig) -> bool {
    let json = config.json.then(|| fmt::layer().json().with_current_span(true));
    let plain = (!config.json).then(fmt::layer);
    let subscriber = Registry::default()
        .with(filter(&config.level))
        .with(json)
        .with(plain);

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return false;
    }
    if let Err(e) = tracing_log::LogTracer::init() {
        tracing::debug!("log records are not forwarded: {}", e);
    }
    tracing::debug!(level = %config.level, json = config.json, "Telemetry initialized");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_is_idempotent() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            json: true,
        };
        let first = init(&config);
        let second = init(&LoggingConfig::default());
        assert_eq!(first, second);
        log::info!("forwarded through tracing-log");
    }

    #[test]
    fn test_invalid_level_falls_back() {
        // Must not panic on a malformed directive.
        let _ = filter("definitely not [a filter");
    }
}
