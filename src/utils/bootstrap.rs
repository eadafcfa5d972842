//! Bootstrap utilities for processes hosting an `Rpc` engine.
//!
//! Shared initialization code: tracing and configuration.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{RpcConfig, LOG_ENV_VAR};
use crate::error::Result;

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initialize tracing with QPC_LOG environment variable.
///
/// Defaults to "info" level if QPC_LOG is not set. Panics if a global
/// subscriber is already installed.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Like `init_tracing`, but returns `false` instead of panicking when a
/// subscriber is already installed.
pub fn try_init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Install tracing (if nobody has yet) and load configuration.
///
/// See `RpcConfig::load` for the sources consulted.
pub fn bootstrap(config_path: Option<&str>) -> Result<RpcConfig> {
    try_init_tracing();
    let config = RpcConfig::load(config_path)?;
    tracing::info!(exchange = %config.exchange, "Configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_second_init_is_rejected_quietly() {
        try_init_tracing();
        assert!(!try_init_tracing());
    }

    #[test]
    #[serial]
    fn test_bootstrap_rejects_missing_config_file() {
        assert!(bootstrap(Some("/nonexistent/qpc-test.yaml")).is_err());
    }
}
