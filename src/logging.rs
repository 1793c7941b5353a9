//! Tracing setup for the CLI.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter, e.g. `offline_cache=debug`.
pub const LOG_ENV: &str = "OFFLINE_CACHE_LOG";

const LOG_FILE: &str = "offline-cache.log";

/// Install the global subscriber. Logs go to stderr, and additionally to a
/// daily-rotated file under `log_dir` when one is given.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

  let Some(dir) = log_dir else {
    tracing_subscriber::registry()
      .with(filter)
      .with(stderr_layer)
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    return Ok(None);
  };

  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
  let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let file_layer = fmt::layer().with_ansi(false).with_writer(writer);

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(Some(guard))
}
