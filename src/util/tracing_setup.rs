//! Logging initialization

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber
///
/// `RUST_LOG` wins over the configured level. Format "json" emits one JSON
/// object per line; anything else falls back to human-readable output.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| anyhow!("invalid log level {:?}: {}", config.level, e))?;

    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format.as_str() {
        "json" => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        _ => registry.with(fmt::layer().with_target(true)).try_init(),
    };

    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}
