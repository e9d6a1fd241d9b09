/*!
 * Logging and tracing initialization
 *
 * Diagnostics go through `tracing`; catalog events go through an
 * [`EventLogger`] handle that is created here and passed down explicitly.
 */

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::{Result, TetherError};
use tether_observability::{EventLogger, JsonLinesSink};

/// Owned by the host process; flush it before exiting
#[derive(Debug, Clone)]
pub struct LoggingHandle {
    events: EventLogger,
}

impl LoggingHandle {
    /// Event logger to thread through constructors
    pub fn events(&self) -> EventLogger {
        self.events.clone()
    }

    /// Flush buffered catalog events
    pub fn shutdown(&self) {
        self.events.flush();
    }
}

/// Install the process-wide subscriber and build the event logger.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingHandle> {
    let env_filter = build_filter(config)?;

    if let Some(ref log_path) = config.file {
        init_file_logging(log_path, env_filter)?;
    } else {
        init_stdout_logging(env_filter)?;
    }

    event_logger(config)
}

/// Event logger for `config` without touching the global subscriber
pub fn event_logger(config: &LoggingConfig) -> Result<LoggingHandle> {
    let mut events = EventLogger::tracing();
    if let Some(ref path) = config.events_file {
        let sink = JsonLinesSink::open(path)
            .map_err(|e| TetherError::Logging(format!("Failed to open events file: {}", e)))?;
        events = events.with_sink(Arc::new(sink));
    }
    Ok(LoggingHandle { events })
}

fn effective_level(config: &LoggingConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let level = effective_level(config);
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("tether={0},tether_connect={0},tether_worker={0}", level)))
        .map_err(|e| TetherError::Logging(format!("Failed to create log filter: {}", e)))
}

/// Initialize logging to stdout/stderr
fn init_stdout_logging(env_filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TetherError::Logging(e.to_string()))
}

/// Initialize logging to a file
fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(log_path)
        .map_err(|e| TetherError::Logging(format!("Failed to create log file: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TetherError::Logging(e.to_string()))
}
