//! Structured logging setup.
//!
//! The library itself only emits `tracing` events; binaries and tests call
//! [`init_logging`] once to install a subscriber. `RUST_LOG` takes precedence
//! over the configured level when set.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install a global fmt subscriber configured from `config`.
///
/// # Errors
/// Returns `ProtocolError::ConfigError` if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = config.effective_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.debug_logging)
        .try_init()
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    tracing::info!(app = %config.app_name, level = %level, "Logging initialized");
    Ok(())
}
