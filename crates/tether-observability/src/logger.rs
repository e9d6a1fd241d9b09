//! Event logger handle and sinks
//!
//! The logger is an explicit handle: components receive an [`EventLogger`]
//! through their constructors instead of reaching for a process-wide static.

use crate::event::{EventId, LogEvent, Severity};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors that can occur while setting up sinks
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Destination for rendered events
pub trait EventSink: Send + Sync {
    fn record(&self, event: &LogEvent);

    fn flush(&self) {}
}

/// Cloneable handle to a set of sinks.
///
/// ## Example
///
/// ```
/// use tether_observability::{EventId, EventLogger};
///
/// let logger = EventLogger::tracing();
/// logger
///     .event(EventId::ExitReceived)
///     .field("session", "4f1c")
///     .emit();
/// ```
#[derive(Clone)]
pub struct EventLogger {
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
}

impl EventLogger {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
        }
    }

    /// Logger forwarding everything to `tracing`
    pub fn tracing() -> Self {
        Self::new(vec![Arc::new(TracingSink)])
    }

    /// Logger that drops every event
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Same sinks plus one more
    pub fn with_sink(&self, sink: Arc<dyn EventSink>) -> Self {
        let mut sinks: Vec<Arc<dyn EventSink>> = self.sinks.iter().cloned().collect();
        sinks.push(sink);
        Self::new(sinks)
    }

    /// Start building an event
    pub fn event(&self, id: EventId) -> EventBuilder<'_> {
        EventBuilder {
            logger: self,
            id,
            fields: BTreeMap::new(),
        }
    }

    /// Emit a pre-rendered event
    pub fn emit(&self, event: LogEvent) {
        for sink in self.sinks.iter() {
            sink.record(&event);
        }
    }

    /// Flush every sink
    pub fn flush(&self) {
        for sink in self.sinks.iter() {
            sink.flush();
        }
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::tracing()
    }
}

impl std::fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogger")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Collects placeholder values for one event
pub struct EventBuilder<'a> {
    logger: &'a EventLogger,
    id: EventId,
    fields: BTreeMap<String, String>,
}

impl EventBuilder<'_> {
    pub fn field(mut self, name: &str, value: impl Display) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    pub fn emit(self) {
        let descriptor = self.id.descriptor();
        for name in descriptor.placeholders() {
            if !self.fields.contains_key(name) {
                tracing::debug!(
                    event = descriptor.name,
                    placeholder = name,
                    "catalog event emitted without a placeholder value"
                );
            }
        }
        self.logger.emit(LogEvent::new(self.id, self.fields));
    }
}

/// Forwards events to `tracing`, mapping severities onto levels
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &LogEvent) {
        let code = event.code;
        let name = event.name.as_str();
        let message = event.message.as_str();
        match event.severity {
            Severity::Verbose => {
                tracing::debug!(event_id = code, event_name = name, "{}", message)
            }
            Severity::Info => tracing::info!(event_id = code, event_name = name, "{}", message),
            Severity::Warning => {
                tracing::warn!(event_id = code, event_name = name, "{}", message)
            }
            Severity::Error => {
                tracing::error!(event_id = code, event_name = name, "{}", message)
            }
        }
    }
}

/// Appends events to a file in JSON Lines format
pub struct JsonLinesSink {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl JsonLinesSink {
    /// Open (or create) `path` for appending; parent directories are created
    pub fn open(path: &Path) -> Result<Self, LoggerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonLinesSink {
    fn record(&self, event: &LogEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to serialize event {}: {}", event.name, e);
                return;
            }
        };
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(writer, "{}", line) {
            tracing::warn!("Failed to write event to {}: {}", self.path.display(), e);
        }
    }

    fn flush(&self) {
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writer.flush() {
            tracing::warn!("Failed to flush {}: {}", self.path.display(), e);
        }
    }
}
