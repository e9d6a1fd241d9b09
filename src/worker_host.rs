//! Worker process host: binds, serves pips and stops after Exit

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TetherConfig;
use crate::error::{Result, TetherError};
use crate::pip::{PipExecutor, EXECUTE_PIP};
use crate::remoting::{self, RemoteExecution};
use tether_observability::EventLogger;
use tether_proto::InvocationIdentity;
use tether_worker::{bind, WorkerError, WorkerServer};

/// How long to wait for the orchestrator's goodbye after Exit
pub const EXIT_LINGER: Duration = Duration::from_secs(5);

/// A running worker
pub struct WorkerHost {
    server: Arc<WorkerServer>,
    remoting: Arc<dyn RemoteExecution>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    serving: JoinHandle<std::result::Result<(), WorkerError>>,
}

impl WorkerHost {
    /// Bind `config.worker.listen` and start serving `identity`.
    ///
    /// Remote execution is initialized first when enabled; a failure there
    /// stops the host from starting.
    pub async fn start(
        config: &TetherConfig,
        identity: InvocationIdentity,
        events: EventLogger,
    ) -> Result<Self> {
        let remoting = remoting::from_config(&config.remoting, events.clone());
        if config.remoting.enabled {
            remoting.initialize().await?;
        }

        let shutdown = CancellationToken::new();
        let executor = PipExecutor::new(remoting.clone(), events.clone(), shutdown.clone());
        let server = Arc::new(
            WorkerServer::new(identity, events).with_handler(EXECUTE_PIP, Arc::new(executor)),
        );

        let listener = bind(&config.worker.listen).await?;
        let local_addr = listener.local_addr()?;
        let serving = tokio::spawn(server.clone().serve(listener, shutdown.clone()));
        info!(
            "Worker for session {} listening on {}",
            server.identity().session_id,
            local_addr
        );

        Ok(Self {
            server,
            remoting,
            local_addr,
            shutdown,
            serving,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn server(&self) -> &Arc<WorkerServer> {
        &self.server
    }

    pub fn remoting(&self) -> &Arc<dyn RemoteExecution> {
        &self.remoting
    }

    /// Wait for Exit, let the orchestrator hang up, then stop
    pub async fn run_until_exit(self, linger: Duration) -> Result<()> {
        self.server.completion().await;
        if tokio::time::timeout(linger, self.server.idle()).await.is_err() {
            warn!(
                "{} connection(s) still open {:?} after exit; stopping anyway",
                self.server.open_connections(),
                linger
            );
        }
        self.stop().await
    }

    /// Stop serving; in-flight pips are cancelled
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        match self.serving.await {
            Ok(result) => result.map_err(TetherError::from),
            Err(e) => Err(TetherError::Worker(WorkerError::Io(std::io::Error::other(
                e.to_string(),
            )))),
        }
    }
}

impl std::fmt::Debug for WorkerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHost")
            .field("local_addr", &self.local_addr)
            .field("state", &self.server.state())
            .finish()
    }
}
