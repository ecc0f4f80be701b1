use std::fs::File;
use std::sync::Mutex;

use serde::Deserialize;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::config::ConfigError;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_to_file: bool,
    pub log_file_path: String,
    /// Lower the default level from `info` to `debug`
    pub debug: bool,
}

impl LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    pub fn default_directive(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    /// Install the global subscriber. Stdout always, plus a file when configured.
    pub fn init(&self) -> Result<(), ConfigError> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_directive()));

        let stdout_layer = tracing_subscriber::fmt::layer()
            .with_file(self.debug)
            .with_line_number(self.debug)
            .with_target(false);

        let file_layer = if self.log_to_file {
            let file = File::create(&self.log_file_path).map_err(|source| ConfigError::Io {
                path: self.log_file_path.clone().into(),
                source,
            })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        } else {
            None
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| ConfigError::Logging(e.to_string()))
    }
}
