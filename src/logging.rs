//! Logger configuration for crawler processes.
//!
//! [`init`] installs a global `tracing` subscriber with one `fmt` layer per
//! configured sink. `RUST_LOG` takes precedence over [`LogConfig::level`].
//! Libraries embedding the crawler that already installed a subscriber keep
//! theirs: a second installation is skipped, not reported as an error.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::CrawlError;

/// Where log lines are written.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum LogSink {
    /// Standard error, with ANSI colours.
    #[default]
    Console,
    /// Append to a file, without colours.
    File(PathBuf),
    /// Both standard error and a file.
    Both(PathBuf),
}

/// Level and destination of crawler logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `predator=debug,sqlx=warn`.
    #[serde(default = "default_level")]
    pub level: String,
    /// Destination.
    #[serde(default)]
    pub sink: LogSink,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            sink: LogSink::Console,
        }
    }
}

impl LogConfig {
    /// Console logging at `level`.
    #[must_use]
    pub fn console(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            sink: LogSink::Console,
        }
    }

    /// Logging at `level` to `sink`.
    #[must_use]
    pub fn with_sink(level: impl Into<String>, sink: LogSink) -> Self {
        Self {
            level: level.into(),
            sink,
        }
    }
}

/// Installs the global subscriber described by `config`.
///
/// # Errors
///
/// Returns [`CrawlError::Logger`] when the level directive is invalid or the
/// log file cannot be opened.
pub fn init(config: &LogConfig) -> Result<(), CrawlError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| CrawlError::Logger(format!("invalid level {:?}: {e}", config.level)))?,
    };

    let (console, path) = match &config.sink {
        LogSink::Console => (true, None),
        LogSink::File(path) => (false, Some(path)),
        LogSink::Both(path) => (true, Some(path)),
    };
    let file = path.map(|path| open_log_file(path)).transpose()?;

    let console_layer = console.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    let file_layer = file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Arc::new(file))
    });

    if tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        debug!("global tracing subscriber already installed, keeping it");
    }
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File, CrawlError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CrawlError::Logger(format!("cannot open log file {}: {e}", path.display())))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.sink, LogSink::Console);
    }

    #[test]
    fn test_deserialize_sinks() {
        let config: LogConfig =
            serde_json::from_str(r#"{"level":"debug","sink":{"kind":"both","path":"/tmp/p.log"}}"#)
                .unwrap();
        assert_eq!(config.sink, LogSink::Both(PathBuf::from("/tmp/p.log")));

        let config: LogConfig = serde_json::from_str(r#"{"sink":{"kind":"console"}}"#).unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.sink, LogSink::Console);
    }

    #[test]
    fn test_unopenable_file_is_logger_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = LogConfig::with_sink(
            "info",
            LogSink::File(temp_dir.path().join("missing").join("crawl.log")),
        );
        assert!(matches!(init(&config), Err(CrawlError::Logger(_))));
    }

    #[test]
    fn test_file_sink_creates_file_and_repeat_init_is_ok() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("crawl.log");
        let config = LogConfig::with_sink("debug", LogSink::File(path.clone()));
        init(&config).unwrap();
        init(&config).unwrap();
        assert!(path.exists());
    }
}
