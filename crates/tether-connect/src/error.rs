//! Error types for the tether-connect crate

use crate::classifier::FailureKind;
use tether_resilience::ResilienceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Invalid worker endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid retry policy: {0}")]
    InvalidPolicy(#[from] ResilienceError),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Connection to worker {worker_id} failed ({kind}): {detail}")]
    ConnectionFailed {
        worker_id: String,
        kind: FailureKind,
        detail: String,
    },

    #[error("Connection to worker {0} is shut down")]
    ConnectionShutdown(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
