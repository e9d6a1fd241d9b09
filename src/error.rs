/*!
 * Error types for Tether
 */

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::remoting::RemotingError;
use crate::vm::VmError;
use tether_connect::ConnectError;
use tether_worker::WorkerError;

pub type Result<T> = std::result::Result<T, TetherError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_SESSION_MISMATCH: i32 = 3;

#[derive(Debug, Error)]
pub enum TetherError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Remoting(#[from] RemotingError),

    #[error(transparent)]
    Vm(#[from] VmError),

    /// Worker's connection reached Shutdown; recreate the proxy to use it again
    #[error("Worker {0} is unusable after a terminal connection failure")]
    WorkerUnusable(String),

    /// A worker refused the session outright
    #[error("Worker {worker} belongs to another session: {reason}")]
    SessionMismatch { worker: String, reason: String },

    /// Some workers did not complete the session cleanly
    #[error("{failed} of {total} workers failed")]
    PartialFailure { failed: usize, total: usize },
}

impl TetherError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TetherError::Config(_)
            | TetherError::ConfigParse { .. }
            | TetherError::Logging(_)
            | TetherError::Worker(_) => EXIT_FATAL,
            TetherError::SessionMismatch { .. } => EXIT_SESSION_MISMATCH,
            TetherError::PartialFailure { .. } | TetherError::WorkerUnusable(_) => EXIT_PARTIAL,
            TetherError::Connect(
                ConnectError::InvalidEndpoint(_)
                | ConnectError::InvalidPolicy(_)
                | ConnectError::DuplicateWorker(_)
                | ConnectError::WorkerNotFound(_),
            ) => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    /// Errors that stop the run before any worker is contacted
    pub fn is_fatal(&self) -> bool {
        self.exit_code() == EXIT_FATAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_resilience::ResilienceError;

    #[test]
    fn test_exit_code_constants() {
        assert_eq!(EXIT_SUCCESS, 0);
        assert_eq!(EXIT_PARTIAL, 1);
        assert_eq!(EXIT_FATAL, 2);
        assert_eq!(EXIT_SESSION_MISMATCH, 3);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TetherError::Config("bad".into()).exit_code(), EXIT_FATAL);
        assert_eq!(
            TetherError::from(ConnectError::WorkerNotFound("w-9".into())).exit_code(),
            EXIT_FATAL
        );
        assert_eq!(
            TetherError::SessionMismatch {
                worker: "w-1".into(),
                reason: "session differs".into()
            }
            .exit_code(),
            EXIT_SESSION_MISMATCH
        );
        assert_eq!(
            TetherError::PartialFailure { failed: 1, total: 3 }.exit_code(),
            EXIT_PARTIAL
        );
        assert_eq!(
            TetherError::WorkerUnusable("w-1".into()).exit_code(),
            EXIT_PARTIAL
        );
        assert_eq!(
            TetherError::from(ConnectError::InvalidPolicy(ResilienceError::NoAttempts)).exit_code(),
            EXIT_FATAL
        );
        assert_eq!(
            TetherError::from(ConnectError::ConnectionShutdown("w".into())).exit_code(),
            EXIT_PARTIAL
        );
    }

    #[test]
    fn test_is_fatal() {
        assert!(TetherError::Logging("x".into()).is_fatal());
        assert!(!TetherError::PartialFailure { failed: 1, total: 1 }.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = TetherError::PartialFailure { failed: 2, total: 5 };
        assert_eq!(err.to_string(), "2 of 5 workers failed");
    }
}
