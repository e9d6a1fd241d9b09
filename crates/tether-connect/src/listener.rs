//! Connection-failure notifications

use crate::classifier::FailureKind;
use crate::state::ConnectionState;
use std::sync::Mutex;
use std::time::SystemTime;

/// Published once per connection when it is torn down by a failure
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionFailureEvent {
    pub worker_id: String,
    pub kind: FailureKind,
    pub detail: String,
    /// State the connection was in when the failure hit
    pub previous_state: ConnectionState,
    pub timestamp: SystemTime,
}

/// Subscriber for connection-failure events.
///
/// Listeners are invoked synchronously, in registration order, on the task
/// that observed the failure. They must not call back into the connection
/// that is notifying them.
pub trait ConnectionListener: Send + Sync {
    fn on_connection_failure(&self, event: &ConnectionFailureEvent);
}

impl<F> ConnectionListener for F
where
    F: Fn(&ConnectionFailureEvent) + Send + Sync,
{
    fn on_connection_failure(&self, event: &ConnectionFailureEvent) {
        self(event)
    }
}

/// Listener that keeps every event it receives
#[derive(Debug, Default)]
pub struct FailureRecorder {
    events: Mutex<Vec<ConnectionFailureEvent>>,
}

impl FailureRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ConnectionFailureEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConnectionListener for FailureRecorder {
    fn on_connection_failure(&self, event: &ConnectionFailureEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
