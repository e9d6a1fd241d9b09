//! Orchestrator: registry of worker proxies for one build session

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::TetherConfig;
use crate::error::{Result, TetherError};
use crate::pip::EXECUTE_PIP;
use crate::remoting::ProcessInfo;
use serde_json::Value;
use tether_connect::{
    CallOutcome, ConnectError, ConnectionFailureEvent, ConnectionState, Endpoint, FailureKind,
    FailureRecorder, ProxySettings, WorkerProxy,
};
use tether_observability::EventLogger;
use tether_proto::InvocationIdentity;

/// Outcomes keyed by worker id
pub type SessionOutcomes = BTreeMap<String, CallOutcome>;

/// Holds one [`WorkerProxy`] per worker.
///
/// Proxies are never recreated behind the caller's back: a worker whose
/// connection shut down stays unusable until it is unregistered and
/// registered again.
///
/// # Example
///
/// ```rust,no_run
/// use tether::orchestrator::Orchestrator;
/// use tether_connect::{Endpoint, ProxySettings};
/// use tether_observability::EventLogger;
/// use tether_proto::InvocationIdentity;
///
/// # async fn example() -> tether::Result<()> {
/// let orchestrator = Orchestrator::new(
///     InvocationIdentity::generate("ci-linux"),
///     ProxySettings::default(),
///     EventLogger::tracing(),
/// )?;
/// orchestrator.register("w-1", "10.0.0.5:7400".parse()?).await?;
///
/// let attached = orchestrator.attach_all().await;
/// tether::orchestrator::check_outcomes(&attached)?;
///
/// orchestrator.exit_all().await;
/// orchestrator.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    identity: InvocationIdentity,
    settings: ProxySettings,
    events: EventLogger,
    workers: RwLock<HashMap<String, Arc<WorkerProxy>>>,
    failures: Arc<FailureRecorder>,
}

impl Orchestrator {
    pub fn new(
        identity: InvocationIdentity,
        settings: ProxySettings,
        events: EventLogger,
    ) -> Result<Self> {
        settings.retry.validate().map_err(ConnectError::from)?;
        Ok(Self {
            identity,
            settings,
            events,
            workers: RwLock::new(HashMap::new()),
            failures: Arc::new(FailureRecorder::new()),
        })
    }

    pub fn from_config(config: &TetherConfig, events: EventLogger) -> Result<Self> {
        config.validate()?;
        Self::new(config.session.identity(), config.proxy_settings(), events)
    }

    pub fn identity(&self) -> &InvocationIdentity {
        &self.identity
    }

    /// Add a worker. Nothing is dialed until the first call.
    pub async fn register(&self, worker_id: &str, endpoint: Endpoint) -> Result<()> {
        let mut workers = self.workers.write().await;
        if workers.contains_key(worker_id) {
            return Err(ConnectError::DuplicateWorker(worker_id.to_string()).into());
        }

        info!("Registering worker {} ({})", worker_id, endpoint);
        let proxy = WorkerProxy::new(
            worker_id,
            endpoint,
            self.identity.clone(),
            self.settings.clone(),
            self.events.clone(),
        )?;
        proxy.add_listener(self.failures.clone());
        workers.insert(worker_id.to_string(), Arc::new(proxy));
        Ok(())
    }

    /// Remove a worker and close its connection
    pub async fn unregister(&self, worker_id: &str) -> Result<()> {
        let proxy = self
            .workers
            .write()
            .await
            .remove(worker_id)
            .ok_or_else(|| ConnectError::WorkerNotFound(worker_id.to_string()))?;

        info!("Unregistering worker {}", worker_id);
        proxy.close().await;
        Ok(())
    }

    pub async fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Proxy for a worker that can still take calls
    pub async fn worker(&self, worker_id: &str) -> Result<Arc<WorkerProxy>> {
        let proxy = self
            .workers
            .read()
            .await
            .get(worker_id)
            .cloned()
            .ok_or_else(|| ConnectError::WorkerNotFound(worker_id.to_string()))?;

        if proxy.state() == ConnectionState::Shutdown {
            return Err(TetherError::WorkerUnusable(worker_id.to_string()));
        }
        Ok(proxy)
    }

    /// Workers whose connection has shut down
    pub async fn unusable_workers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .workers
            .read()
            .await
            .iter()
            .filter(|(_, proxy)| proxy.state() == ConnectionState::Shutdown)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Terminal connection failures seen so far, in order
    pub fn failures(&self) -> Vec<ConnectionFailureEvent> {
        self.failures.events()
    }

    /// Attach every registered worker concurrently
    pub async fn attach_all(&self) -> SessionOutcomes {
        self.for_each_worker(false, |proxy| async move { proxy.attach().await })
            .await
    }

    /// Ask every usable worker to end the session.
    ///
    /// Workers whose connection already shut down are skipped and have no
    /// entry in the result.
    pub async fn exit_all(&self) -> SessionOutcomes {
        self.for_each_worker(true, |proxy| async move { proxy.exit().await })
            .await
    }

    /// Run a named work call on one worker
    pub async fn dispatch(&self, worker_id: &str, call: &str, payload: Value) -> Result<CallOutcome> {
        let proxy = self.worker(worker_id).await?;
        Ok(proxy.call(call, payload).await)
    }

    /// Run one pip on one worker
    pub async fn execute_pip(&self, worker_id: &str, process: &ProcessInfo) -> Result<CallOutcome> {
        let payload = serde_json::to_value(process)
            .map_err(|e| TetherError::Config(format!("Invalid pip {}: {}", process.pip_id, e)))?;
        self.dispatch(worker_id, EXECUTE_PIP, payload).await
    }

    /// Close every connection; idempotent
    pub async fn shutdown(&self) {
        let proxies: Vec<Arc<WorkerProxy>> = self.workers.read().await.values().cloned().collect();
        for proxy in proxies {
            proxy.close().await;
        }
        debug!("Orchestrator for session {} shut down", self.identity.session_id);
    }

    async fn for_each_worker<F, Fut>(&self, usable_only: bool, call: F) -> SessionOutcomes
    where
        F: Fn(Arc<WorkerProxy>) -> Fut,
        Fut: std::future::Future<Output = CallOutcome> + Send + 'static,
    {
        let proxies: Vec<(String, Arc<WorkerProxy>)> = self
            .workers
            .read()
            .await
            .iter()
            .filter(|(_, proxy)| !usable_only || proxy.state() != ConnectionState::Shutdown)
            .map(|(id, proxy)| (id.clone(), proxy.clone()))
            .collect();

        let mut tasks = JoinSet::new();
        for (id, proxy) in proxies {
            let pending = call(proxy);
            tasks.spawn(async move { (id, pending.await) });
        }

        let mut outcomes = SessionOutcomes::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    outcomes.insert(id, outcome);
                }
                Err(e) => warn!("Worker task failed: {}", e),
            }
        }
        outcomes
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("identity", &self.identity)
            .field("failures", &self.failures.len())
            .finish()
    }
}

/// Fold per-worker outcomes into one result.
///
/// A session mismatch anywhere wins over other failures.
pub fn check_outcomes(outcomes: &SessionOutcomes) -> Result<()> {
    for (worker, outcome) in outcomes {
        if outcome.failure_kind() == Some(FailureKind::UnrecoverableFailure) {
            return Err(TetherError::SessionMismatch {
                worker: worker.clone(),
                reason: outcome.to_string(),
            });
        }
    }

    let failed = outcomes.values().filter(|o| !o.succeeded).count();
    if failed > 0 {
        return Err(TetherError::PartialFailure {
            failed,
            total: outcomes.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_connect::{CallFailure, CallState};
    use tether_resilience::RetryPolicy;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            InvocationIdentity::new("s-1", "env"),
            ProxySettings::default(),
            EventLogger::disabled(),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let settings = ProxySettings {
            retry: RetryPolicy {
                max_attempts: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = Orchestrator::new(
            InvocationIdentity::new("s-1", "env"),
            settings,
            EventLogger::disabled(),
        );
        assert!(matches!(
            result,
            Err(TetherError::Connect(ConnectError::InvalidPolicy(_)))
        ));
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let orch = orchestrator();
        orch.register("w-2", Endpoint::new("127.0.0.1", 1)).await.unwrap();
        orch.register("w-1", Endpoint::new("127.0.0.1", 2)).await.unwrap();
        assert_eq!(orch.worker_ids().await, vec!["w-1", "w-2"]);

        let dup = orch.register("w-1", Endpoint::new("127.0.0.1", 3)).await;
        assert!(matches!(
            dup,
            Err(TetherError::Connect(ConnectError::DuplicateWorker(_)))
        ));

        orch.unregister("w-1").await.unwrap();
        assert_eq!(orch.worker_ids().await, vec!["w-2"]);
        assert!(matches!(
            orch.unregister("w-1").await,
            Err(TetherError::Connect(ConnectError::WorkerNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_unknown_worker() {
        let orch = orchestrator();
        assert!(matches!(
            orch.worker("nope").await,
            Err(TetherError::Connect(ConnectError::WorkerNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_closed_worker_is_unusable() {
        let orch = orchestrator();
        orch.register("w-1", Endpoint::new("127.0.0.1", 1)).await.unwrap();
        orch.shutdown().await;

        assert!(matches!(
            orch.worker("w-1").await,
            Err(TetherError::WorkerUnusable(_))
        ));
        assert_eq!(orch.unusable_workers().await, vec!["w-1"]);
        // A clean close is not a failure
        assert!(orch.failures().is_empty());
    }

    #[tokio::test]
    async fn test_exit_all_skips_shut_down_workers() {
        let orch = orchestrator();
        orch.register("w-1", Endpoint::new("127.0.0.1", 1)).await.unwrap();
        orch.register("w-2", Endpoint::new("127.0.0.1", 2)).await.unwrap();
        orch.worker("w-1").await.unwrap().close().await;

        let exited = orch.exit_all().await;
        assert!(!exited.contains_key("w-1"));
        assert!(exited.contains_key("w-2"));
    }

    #[test]
    fn test_check_outcomes() {
        let mut outcomes = SessionOutcomes::new();
        outcomes.insert(
            "w-1".to_string(),
            CallOutcome::succeeded("Attach", 1, Value::Null),
        );
        assert!(check_outcomes(&outcomes).is_ok());

        outcomes.insert("w-2".to_string(), CallOutcome::rejected("Attach"));
        assert!(matches!(
            check_outcomes(&outcomes),
            Err(TetherError::PartialFailure { failed: 1, total: 2 })
        ));

        outcomes.insert(
            "w-3".to_string(),
            CallOutcome::failed(
                "Attach",
                1,
                CallFailure::Connection(FailureKind::UnrecoverableFailure),
            ),
        );
        match check_outcomes(&outcomes) {
            Err(TetherError::SessionMismatch { worker, .. }) => assert_eq!(worker, "w-3"),
            other => panic!("expected session mismatch, got {:?}", other),
        }
        assert_eq!(outcomes["w-2"].final_state, CallState::Cancelled);
    }
}
