use super::{Installer, ProcessInfo, RemoteExecution, RemoteProcessHandle, RemotingError};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// No remote execution backend
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledRemoteExecution;

#[async_trait]
impl RemoteExecution for DisabledRemoteExecution {
    fn is_initialized(&self) -> bool {
        false
    }

    async fn initialize(&self) -> Result<(), RemotingError> {
        Err(RemotingError::RemotingUnsupported)
    }

    fn create_and_start(
        &self,
        _process: ProcessInfo,
        _cancel: &CancellationToken,
    ) -> Result<RemoteProcessHandle, RemotingError> {
        Err(RemotingError::RemotingUnsupported)
    }

    fn input_prediction(&self, _process: &ProcessInfo) -> Vec<PathBuf> {
        Vec::new()
    }

    fn installer(&self) -> Option<&dyn Installer> {
        None
    }

    fn register_static_directories(&self, _paths: Vec<PathBuf>) {}
}
