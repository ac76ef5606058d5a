//! Logging initialization.
//!
//! Logs go to stderr by default, or to `{logging.dir}/nebula-{datetime}.log`
//! when `logging.to_file` is set. Every worker event that belongs to a trace
//! is emitted through [`trace_log!`](crate::trace_log) and carries its
//! `trace_id`, so one request can be followed by filtering on that field.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Result of logging initialization
pub struct LoggingHandle {
    /// Flushes buffered file output when dropped; keep it alive in `main`
    pub _guard: Option<WorkerGuard>,

    /// Path to the log file (only set with file logging enabled)
    pub log_file_path: Option<PathBuf>,
}

/// Where formatted events are written
struct Sink {
    writer: BoxMakeWriter,
    ansi: bool,
    guard: Option<WorkerGuard>,
    path: Option<PathBuf>,
}

/// Log filter directive: `--debug` wins over the configured level
pub fn effective_level(config: &Config, debug_override: bool) -> String {
    if debug_override {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    }
}

/// File name for a log file started now
pub fn log_file_name() -> String {
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    format!("nebula-{}.log", timestamp)
}

fn open_sink(config: &Config) -> Result<Sink> {
    if !config.logging.to_file {
        return Ok(Sink {
            writer: BoxMakeWriter::new(std::io::stderr),
            ansi: true,
            guard: None,
            path: None,
        });
    }

    let dir = config.logs_path();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let name = log_file_name();
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name.clone())
        .build(&dir)
        .context("Failed to open log file")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    Ok(Sink {
        writer: BoxMakeWriter::new(writer),
        ansi: false,
        guard: Some(guard),
        path: Some(dir.join(name)),
    })
}

/// Install the global subscriber.
///
/// A valid `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &Config, debug_override: bool) -> Result<LoggingHandle> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(effective_level(config, debug_override)));
    let sink = open_sink(config)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(sink.ansi)
                .with_writer(sink.writer),
        )
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(LoggingHandle {
        _guard: sink.guard,
        log_file_path: sink.path,
    })
}
