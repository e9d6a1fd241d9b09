//! Testing utilities
//!
//! [`EventCapture`] keeps every event in memory so tests can assert on what a
//! component reported.

use crate::event::{EventId, LogEvent};
use crate::logger::{EventLogger, EventSink};
use std::sync::{Arc, Mutex};

/// Event capture utility for testing
///
/// ## Example
///
/// ```
/// use tether_observability::{EventCapture, EventId};
///
/// let capture = EventCapture::new();
/// let logger = capture.logger();
///
/// logger.event(EventId::WorkerExited).field("worker", "w-1").emit();
///
/// assert_eq!(capture.event_count(), 1);
/// assert_eq!(capture.count(EventId::WorkerExited), 1);
/// ```
#[derive(Clone, Default)]
pub struct EventCapture {
    events: Arc<Mutex<Vec<LogEvent>>>,
}

impl EventCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink writing into this capture
    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::new(self.clone())
    }

    /// Logger whose only sink is this capture
    pub fn logger(&self) -> EventLogger {
        EventLogger::new(vec![self.sink()])
    }

    /// Get all captured events
    pub fn events(&self) -> Vec<LogEvent> {
        self.lock().clone()
    }

    /// Get the number of captured events
    pub fn event_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of captured events with the given id
    pub fn count(&self, id: EventId) -> usize {
        let code = id.code();
        self.lock().iter().filter(|e| e.code == code).count()
    }

    /// Find events matching a predicate
    pub fn find_events<F>(&self, predicate: F) -> Vec<LogEvent>
    where
        F: Fn(&LogEvent) -> bool,
    {
        self.events().into_iter().filter(predicate).collect()
    }

    /// Events with the given id, in emission order
    pub fn events_for(&self, id: EventId) -> Vec<LogEvent> {
        let code = id.code();
        self.find_events(|e| e.code == code)
    }

    /// Clear all captured events
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogEvent>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EventSink for EventCapture {
    fn record(&self, event: &LogEvent) {
        self.lock().push(event.clone());
    }
}
