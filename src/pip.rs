/*!
 * Pip execution on the worker
 *
 * `ExecutePip` calls carry a [`ProcessInfo`]. When remote execution is
 * initialized the pip is handed to it; otherwise it runs as a plain local
 * process. Either way the worker's shutdown token cancels it.
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tether_observability::EventLogger;
use tether_proto::{RemoteError, RemoteErrorKind};
use tether_worker::WorkHandler;
use tokio_util::sync::CancellationToken;

use crate::remoting::process::{spawn_process, LaunchSpec};
use crate::remoting::{ProcessInfo, RemoteExecution, RemoteProcessResult, RemotingError};

/// Work call name for running one pip
pub const EXECUTE_PIP: &str = "ExecutePip";

/// Reply to `ExecutePip`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipResponse {
    pub result: RemoteProcessResult,
    /// Ran through remote execution rather than locally
    pub remoted: bool,
    pub predicted_inputs: Vec<PathBuf>,
}

/// [`WorkHandler`] for `ExecutePip`
pub struct PipExecutor {
    remoting: Arc<dyn RemoteExecution>,
    events: EventLogger,
    shutdown: CancellationToken,
}

impl PipExecutor {
    pub fn new(
        remoting: Arc<dyn RemoteExecution>,
        events: EventLogger,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            remoting,
            events,
            shutdown,
        }
    }

    pub async fn execute(&self, process: ProcessInfo) -> Result<PipResponse, RemotingError> {
        let remoted = self.remoting.is_initialized();
        let predicted_inputs = self.remoting.input_prediction(&process);

        let handle = if remoted {
            self.remoting.create_and_start(process, &self.shutdown)?
        } else {
            spawn_process(
                process,
                LaunchSpec::default(),
                &self.shutdown,
                self.events.clone(),
            )
        };

        Ok(PipResponse {
            result: handle.await?,
            remoted,
            predicted_inputs,
        })
    }
}

#[async_trait]
impl WorkHandler for PipExecutor {
    async fn handle(&self, _call: &str, body: Value) -> Result<Value, RemoteError> {
        let process: ProcessInfo = serde_json::from_value(body).map_err(|e| RemoteError {
            kind: RemoteErrorKind::InvalidPayload,
            message: format!("invalid pip: {}", e),
        })?;

        let response = self.execute(process).await.map_err(|e| RemoteError {
            kind: RemoteErrorKind::HandlerFailed,
            message: e.to_string(),
        })?;

        serde_json::to_value(&response).map_err(|e| RemoteError {
            kind: RemoteErrorKind::HandlerFailed,
            message: e.to_string(),
        })
    }
}
