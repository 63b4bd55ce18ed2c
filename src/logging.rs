//! Log output to stderr and a daily rolling file.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,mam_offline=debug";

/// Install the global subscriber. Keep the guard alive until exit so the file is flushed.
pub fn init(logs_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(logs_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", logs_dir.display(), e))?;

  let file_appender = tracing_appender::rolling::daily(logs_dir, "mam-offline.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
