use std::fs::OpenOptions;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// Installs the global subscriber: stdout filtered by `RUST_LOG` (or the
/// configured filter) plus the debug log file, which records everything down
/// to debug level.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and closes the file writer.
pub fn init(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .with_context(|| format!("invalid [logging].filter {:?}", config.filter))?,
    };

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(filter);

    let path = config
        .debug_log
        .as_ref()
        .filter(|path| !path.as_os_str().is_empty());
    let (file_layer, guard) = match path {
        Some(path) => {
            let mut options = OpenOptions::new();
            options.create(true);
            if config.truncate_on_start {
                options.write(true).truncate(true);
            } else {
                options.append(true);
            }
            let file = options
                .open(path)
                .with_context(|| format!("open debug log {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer)
                .with_filter(LevelFilter::DEBUG);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(guard)
}
