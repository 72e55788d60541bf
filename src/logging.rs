use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
  fmt,
  layer::{Layer, SubscriberExt},
  util::SubscriberInitExt,
  EnvFilter,
};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "shellcache.log";

/// Filter built from the configured level; `RUST_LOG` is not consulted.
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
  EnvFilter::try_new(config.level.trim())
    .map_err(|e| eyre!("Invalid logging level '{}': {}", config.level, e))
}

/// Install the global subscriber.
///
/// With a log directory, output goes to a daily-rolling file through a background writer; keep the
/// returned guard alive or buffered lines are lost. Otherwise logs go to stderr.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let env_filter = filter(config)?;

  let (fmt_layer, guard) = match &config.directory {
    Some(directory) => {
      std::fs::create_dir_all(directory).map_err(|e| {
        eyre!(
          "Failed to create log directory {}: {}",
          directory.display(),
          e
        )
      })?;
      let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .boxed();
      (layer, Some(guard))
    }
    None => (
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed(),
      None,
    ),
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(fmt_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
