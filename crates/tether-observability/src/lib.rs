//! Tether structured events
//!
//! Every noteworthy thing the session layer and its collaborators do is
//! reported as a catalog event: a stable numeric code, a severity and a
//! message template with named placeholders.
//!
//! ## Pieces
//!
//! 1. **Catalog** ([`EventId`]): the fixed list of events and their templates.
//! 2. **Handle** ([`EventLogger`]): cheap to clone, passed explicitly to every
//!    component that emits events. There is no global accessor.
//! 3. **Sinks** ([`EventSink`]): where rendered events go. [`TracingSink`]
//!    forwards to `tracing`, [`JsonLinesSink`] appends to a file and
//!    [`EventCapture`] keeps them in memory for tests.
//!
//! ## Quick Start
//!
//! ```
//! use tether_observability::{EventCapture, EventId, EventLogger};
//!
//! let capture = EventCapture::new();
//! let logger = EventLogger::new(vec![capture.sink()]);
//!
//! logger
//!     .event(EventId::WorkerAttached)
//!     .field("worker", "w-1")
//!     .field("session", "4f1c")
//!     .emit();
//!
//! assert_eq!(capture.count(EventId::WorkerAttached), 1);
//! assert_eq!(capture.events()[0].message, "Worker w-1 attached to session 4f1c");
//! ```

pub mod event;
pub mod logger;
pub mod testing;

pub use event::{EventDescriptor, EventId, LogEvent, Severity};
pub use logger::{EventBuilder, EventLogger, EventSink, JsonLinesSink, LoggerError, TracingSink};
pub use testing::EventCapture;

/// Prelude module for convenient imports
///
/// ```
/// use tether_observability::prelude::*;
/// ```
pub mod prelude {
    pub use crate::event::{EventId, LogEvent, Severity};
    pub use crate::logger::{EventLogger, EventSink};
}
