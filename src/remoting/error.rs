//! Error types for remote execution

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemotingError {
    /// No remote execution backend is configured
    #[error("Remote execution is not supported in this configuration")]
    RemotingUnsupported,

    #[error("Remote execution has not been initialized")]
    NotInitialized,

    #[error("Remote execution client not found at {0}")]
    ClientNotFound(PathBuf),

    #[error("Failed to install remote execution client: {0}")]
    InstallFailed(String),

    #[error("Failed to start {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },

    #[error("Pip {0} was cancelled")]
    Cancelled(String),

    /// The task driving the process panicked or was aborted
    #[error("Process task failed: {0}")]
    TaskFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RemotingError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RemotingError::Cancelled(_))
    }
}
