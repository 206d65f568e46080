// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Tessera Authors

//! Tracing subscriber bootstrap.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Error, Result};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
///
/// # Errors
///
/// Returns [`Error::Config`] if the level cannot be parsed or a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::Config(format!("invalid log level '{}': {e}", config.level)))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer();

    let installed = match config.format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).try_init()
        }
        LogFormat::Pretty => tracing_subscriber::registry().with(filter).with(fmt_layer).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))?;
    tracing::debug!(level = %config.level, format = ?config.format, "logging initialized");
    Ok(())
}
