//! Logging infrastructure for keen
//!
//! Logs go to `~/.local/state/keen/keen.log.<date>` following XDG standards,
//! optionally mirrored to stderr for interactive use.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Initialize the logging system
///
/// The file log keeps at most `config.max_files` daily files; `RUST_LOG`
/// overrides `config.level` for it. With `console` set, events at or above
/// that level are also printed to stderr.
pub fn init(config: &LoggingConfig, console: Option<Level>) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("keen.log")
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(file_filter);

    let console_layer = console.map(|level| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .with_filter(LevelFilter::from_level(level))
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install subscriber: {}", e)))?;

    tracing::info!(
        log_file = %Config::log_path().display(),
        level = %config.level,
        console = ?console,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Console level for a `-v` count: none, info, debug, then trace
pub fn console_level(verbosity: u8) -> Option<Level> {
    match verbosity {
        0 => None,
        1 => Some(Level::INFO),
        2 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

/// Initialize logging for tests (logs to the test writer)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Keeps the background log writer alive; flushes on drop
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}
