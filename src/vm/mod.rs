//! VM command proxy: JSON files exchanged with a runner inside a VM

pub mod messages;
pub mod proxy;

pub use messages::{
    InitializeVmRequest, ProcessState, ProcessStateInfo, RunRequest, RunResult, TerminationReason,
};
pub use proxy::{commands, VmCommandProxy};

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed VM document {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize VM document: {0}")]
    Serialize(#[from] serde_json::Error),
}
