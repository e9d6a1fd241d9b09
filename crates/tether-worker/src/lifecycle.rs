//! Worker session lifecycle
//!
//! ```text
//!                    ┌─────────────┐
//!                    │    Idle     │ ← listening, no session yet
//!                    └──────┬──────┘
//!                           │ accepted Attach
//!                    ┌──────▼──────┐
//!                    │  Attached   │ ← work calls accepted
//!                    └──────┬──────┘
//!                           │ Exit
//!                    ┌──────▼──────┐
//!                    │   Exited    │ ← in-flight calls finish, no new ones
//!                    └──────┬──────┘
//!                           │ server stopped
//!                    ┌──────▼──────┐
//!                    │  Shutdown   │
//!                    └─────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use tether_worker::lifecycle::{WorkerLifecycle, WorkerState};
//!
//! let mut lifecycle = WorkerLifecycle::new("session-1");
//! assert_eq!(lifecycle.state(), WorkerState::Idle);
//!
//! lifecycle.on_attached();
//! assert!(lifecycle.accepts_work());
//!
//! lifecycle.on_exited();
//! assert!(!lifecycle.accepts_work());
//! ```

use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for the orchestrator to attach
    Idle,

    /// Session bound; work calls are served
    Attached,

    /// Exit received; no new work
    Exited,

    /// Server stopped
    Shutdown,
}

impl WorkerState {
    pub fn as_str(&self) -> &str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Attached => "attached",
            WorkerState::Exited => "exited",
            WorkerState::Shutdown => "shutdown",
        }
    }
}

/// One recorded state change
#[derive(Debug, Clone)]
pub struct WorkerTransition {
    pub session_id: String,
    pub from: WorkerState,
    pub to: WorkerState,
    pub timestamp: SystemTime,
}

/// State machine for the worker's side of one session
#[derive(Debug)]
pub struct WorkerLifecycle {
    session_id: String,
    state: WorkerState,
    state_entered_at: Instant,
    transitions: Vec<WorkerTransition>,
    active_calls: u32,
}

impl WorkerLifecycle {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: WorkerState::Idle,
            state_entered_at: Instant::now(),
            transitions: Vec::new(),
            active_calls: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn accepts_work(&self) -> bool {
        self.state == WorkerState::Attached
    }

    /// Exited with nothing left running
    pub fn is_drained(&self) -> bool {
        self.state == WorkerState::Exited && self.active_calls == 0
    }

    pub fn time_in_state(&self) -> std::time::Duration {
        self.state_entered_at.elapsed()
    }

    pub fn active_calls(&self) -> u32 {
        self.active_calls
    }

    pub fn call_started(&mut self) {
        self.active_calls += 1;
    }

    pub fn call_completed(&mut self) {
        self.active_calls = self.active_calls.saturating_sub(1);
    }

    /// Idle → Attached
    pub fn on_attached(&mut self) -> Option<WorkerTransition> {
        if self.state != WorkerState::Idle {
            return None;
        }
        self.transition(WorkerState::Attached)
    }

    /// Attached → Exited
    pub fn on_exited(&mut self) -> Option<WorkerTransition> {
        if self.state != WorkerState::Attached {
            return None;
        }
        self.transition(WorkerState::Exited)
    }

    /// Any → Shutdown
    pub fn on_shutdown(&mut self) -> Option<WorkerTransition> {
        if self.state == WorkerState::Shutdown {
            return None;
        }
        self.transition(WorkerState::Shutdown)
    }

    pub fn transitions(&self) -> &[WorkerTransition] {
        &self.transitions
    }

    fn transition(&mut self, new_state: WorkerState) -> Option<WorkerTransition> {
        let transition = WorkerTransition {
            session_id: self.session_id.clone(),
            from: self.state,
            to: new_state,
            timestamp: SystemTime::now(),
        };

        self.state = new_state;
        self.state_entered_at = Instant::now();
        self.transitions.push(transition.clone());

        Some(transition)
    }
}
