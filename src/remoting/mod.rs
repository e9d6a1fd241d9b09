//! Remote execution offload
//!
//! Decides where a pip runs when a remote execution service is available.
//! Two variants implement [`RemoteExecution`]:
//!
//! - [`DisabledRemoteExecution`]: no backend; `initialize` fails with
//!   [`RemotingError::RemotingUnsupported`]
//! - [`ActiveRemoteExecution`]: local-process backend with an installer,
//!   client discovery and repo config overrides
//!
//! The variant is picked once, from configuration, by [`from_config`].
//!
//! # Example
//!
//! ```rust,no_run
//! use tether::config::RemotingConfig;
//! use tether::remoting::{self, ProcessInfo};
//! use tether_observability::EventLogger;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), tether::remoting::RemotingError> {
//! let config = RemotingConfig { enabled: true, ..Default::default() };
//! let remoting = remoting::from_config(&config, EventLogger::tracing());
//! remoting.initialize().await?;
//!
//! let process = ProcessInfo::new("pip-1", "/bin/true");
//! let result = remoting.create_and_start(process, &CancellationToken::new())?.await?;
//! assert!(result.success());
//! # Ok(())
//! # }
//! ```

mod active;
mod disabled;
pub mod error;
pub mod process;

pub use active::{ActiveRemoteExecution, LocalInstaller, INSTALL_MANIFEST};
pub use disabled::DisabledRemoteExecution;
pub use error::RemotingError;
pub use process::{ProcessInfo, RemoteProcessHandle, RemoteProcessResult};

use crate::config::RemotingConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tether_observability::EventLogger;
use tokio_util::sync::CancellationToken;

/// Provisions the remote execution client
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install the client; returns whether it is usable afterwards.
    ///
    /// An existing install is kept unless `force_install` is set.
    async fn install(&self, cancel: &CancellationToken, force_install: bool) -> bool;
}

/// Remote execution collaborator
#[async_trait]
pub trait RemoteExecution: Send + Sync {
    fn is_initialized(&self) -> bool;

    async fn initialize(&self) -> Result<(), RemotingError>;

    /// Start `process`; cancelling `cancel` or dropping the handle kills it
    fn create_and_start(
        &self,
        process: ProcessInfo,
        cancel: &CancellationToken,
    ) -> Result<RemoteProcessHandle, RemotingError>;

    /// Files the process is expected to read
    fn input_prediction(&self, process: &ProcessInfo) -> Vec<PathBuf>;

    fn installer(&self) -> Option<&dyn Installer>;

    /// Directories whose contents never change during the build
    fn register_static_directories(&self, paths: Vec<PathBuf>);
}

/// Pick the variant selected by `config`
pub fn from_config(config: &RemotingConfig, events: EventLogger) -> Arc<dyn RemoteExecution> {
    if config.enabled {
        Arc::new(ActiveRemoteExecution::new(config.clone(), events))
    } else {
        Arc::new(DisabledRemoteExecution)
    }
}
