//! Connection state machine
//!
//! ```text
//!        ┌───────────┐
//!        │  Created  │ <─────────────┐
//!        └─────┬─────┘               │ transient connect failure
//!              │ first call           │
//!        ┌─────▼──────┐ ─────────────┘
//!        │ Connecting │
//!        └─────┬──────┘
//!              │ greeting done
//!        ┌─────▼─────┐
//!        │ Connected │
//!        └─────┬─────┘
//!              │ exit acknowledged
//!        ┌─────▼─────┐
//!        │ Stopping  │
//!        └─────┬─────┘
//!              │ close() or terminal failure (from any state)
//!        ┌─────▼─────┐
//!        │ Shutdown  │
//!        └───────────┘
//! ```
//!
//! `Shutdown` is absorbing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Instant, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Constructed; no transport yet
    Created,
    /// Dialing and greeting the worker
    Connecting,
    /// Transport up, calls flow
    Connected,
    /// Exit acknowledged; waiting for close
    Stopping,
    /// Torn down; no further calls
    Shutdown,
}

impl ConnectionState {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionState::Created => "created",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Stopping => "stopping",
            ConnectionState::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub worker_id: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub timestamp: SystemTime,
}

/// Tracks the state of one worker connection.
///
/// Every `on_*` method returns the transition it made, or `None` when the
/// current state does not allow it.
#[derive(Debug)]
pub struct ConnectionLifecycle {
    worker_id: String,
    state: ConnectionState,
    state_entered_at: Instant,
    history: Vec<StateTransition>,
}

impl ConnectionLifecycle {
    pub fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            state: ConnectionState::Created,
            state_entered_at: Instant::now(),
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_shutdown(&self) -> bool {
        self.state == ConnectionState::Shutdown
    }

    pub fn time_in_state(&self) -> std::time::Duration {
        self.state_entered_at.elapsed()
    }

    /// Created → Connecting
    pub fn on_connecting(&mut self) -> Option<StateTransition> {
        if self.state != ConnectionState::Created {
            return None;
        }
        self.transition(ConnectionState::Connecting)
    }

    /// Connecting → Connected
    pub fn on_connected(&mut self) -> Option<StateTransition> {
        if self.state != ConnectionState::Connecting {
            return None;
        }
        self.transition(ConnectionState::Connected)
    }

    /// Connecting → Created, after a dial that may be retried
    pub fn on_connect_failed(&mut self) -> Option<StateTransition> {
        if self.state != ConnectionState::Connecting {
            return None;
        }
        self.transition(ConnectionState::Created)
    }

    /// Connected → Stopping
    pub fn on_stopping(&mut self) -> Option<StateTransition> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        self.transition(ConnectionState::Stopping)
    }

    /// Any → Shutdown, once
    pub fn on_shutdown(&mut self) -> Option<StateTransition> {
        if self.state == ConnectionState::Shutdown {
            return None;
        }
        self.transition(ConnectionState::Shutdown)
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    fn transition(&mut self, new_state: ConnectionState) -> Option<StateTransition> {
        let transition = StateTransition {
            worker_id: self.worker_id.clone(),
            from: self.state,
            to: new_state,
            timestamp: SystemTime::now(),
        };

        self.state = new_state;
        self.state_entered_at = Instant::now();
        self.history.push(transition.clone());

        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let lc = ConnectionLifecycle::new("w-1");
        assert_eq!(lc.state(), ConnectionState::Created);
        assert!(!lc.is_shutdown());
        assert!(lc.history().is_empty());
    }

    #[test]
    fn test_happy_path() {
        let mut lc = ConnectionLifecycle::new("w-1");

        let t = lc.on_connecting().unwrap();
        assert_eq!((t.from, t.to), (ConnectionState::Created, ConnectionState::Connecting));

        lc.on_connected().unwrap();
        lc.on_stopping().unwrap();

        let t = lc.on_shutdown().unwrap();
        assert_eq!((t.from, t.to), (ConnectionState::Stopping, ConnectionState::Shutdown));
        assert_eq!(lc.history().len(), 4);
    }

    #[test]
    fn test_connect_failure_returns_to_created() {
        let mut lc = ConnectionLifecycle::new("w-1");
        lc.on_connecting();

        let t = lc.on_connect_failed().unwrap();
        assert_eq!(t.to, ConnectionState::Created);

        // A second dial is allowed
        assert!(lc.on_connecting().is_some());
    }

    #[test]
    fn test_shutdown_is_absorbing() {
        let mut lc = ConnectionLifecycle::new("w-1");
        lc.on_shutdown().unwrap();

        assert!(lc.on_shutdown().is_none());
        assert!(lc.on_connecting().is_none());
        assert!(lc.on_connected().is_none());
        assert!(lc.on_connect_failed().is_none());
        assert!(lc.on_stopping().is_none());
        assert_eq!(lc.state(), ConnectionState::Shutdown);
        assert_eq!(lc.history().len(), 1);
    }

    #[test]
    fn test_invalid_transitions_return_none() {
        let mut lc = ConnectionLifecycle::new("w-1");

        // Can't stop before connecting
        assert!(lc.on_stopping().is_none());
        assert!(lc.on_connected().is_none());

        lc.on_connecting();
        assert!(lc.on_connecting().is_none());
    }

    #[test]
    fn test_state_as_str() {
        assert_eq!(ConnectionState::Created.as_str(), "created");
        assert_eq!(ConnectionState::Connecting.as_str(), "connecting");
        assert_eq!(ConnectionState::Connected.as_str(), "connected");
        assert_eq!(ConnectionState::Stopping.as_str(), "stopping");
        assert_eq!(ConnectionState::Shutdown.to_string(), "shutdown");
    }
}
