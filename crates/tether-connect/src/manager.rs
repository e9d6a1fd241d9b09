//! ConnectionManager: owns one worker connection and its lifecycle
//!
//! The manager is the single place where failures turn into state changes.
//! Every classified failure is recorded as an observation; the first
//! terminal one (anything but a transient connection error) moves the
//! connection to `Shutdown`, releases the transport and notifies listeners
//! exactly once.

use crate::channel::{ChannelEventSink, Endpoint, RpcChannel};
use crate::classifier::{classify, FailureObservation, RawOutcome};
use crate::dispatcher::{AttemptFailure, CallDispatcher, FailureReporter, ResponseCheck};
use crate::error::ConnectError;
use crate::listener::{ConnectionFailureEvent, ConnectionListener};
use crate::outcome::CallOutcome;
use crate::state::{ConnectionLifecycle, ConnectionState, StateTransition};
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tether_observability::{EventId, EventLogger};
use tether_proto::CallResult;
use tether_resilience::RetryPolicy;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Timeouts and naming for one connection
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Bound on dialing plus greeting
    pub connect_timeout: Duration,
    /// Bound on each call attempt, dial included
    pub call_timeout: Duration,
    /// Name announced to the worker
    pub local_name: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            local_name: "tether-orchestrator".to_string(),
        }
    }
}

/// Attach request re-sent on every fresh transport once the session attached
#[derive(Clone)]
struct AttachReplay {
    call: String,
    body: Value,
    check: fn(&Value) -> ResponseCheck,
}

/// Owner of one worker connection
pub struct ConnectionManager {
    worker_id: String,
    channel: RpcChannel,
    dispatcher: CallDispatcher,
    connect_timeout: Duration,
    lifecycle: Mutex<ConnectionLifecycle>,
    observations: Mutex<Vec<FailureObservation>>,
    terminal: Mutex<Option<ConnectionFailureEvent>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    /// Held while a failure is applied and published, so notifications
    /// are delivered in observation order
    notify: Mutex<()>,
    attach_replay: Mutex<Option<AttachReplay>>,
    shutdown: watch::Sender<bool>,
    events: EventLogger,
}

impl ConnectionManager {
    pub fn new(
        worker_id: impl Into<String>,
        endpoint: Endpoint,
        settings: ConnectionSettings,
        events: EventLogger,
    ) -> Arc<Self> {
        let worker_id = worker_id.into();
        Arc::new_cyclic(|me: &Weak<ConnectionManager>| {
            let sink: Weak<dyn ChannelEventSink> = me.clone();
            let (shutdown, _) = watch::channel(false);
            ConnectionManager {
                channel: RpcChannel::new(endpoint, settings.local_name.clone(), sink),
                dispatcher: CallDispatcher::new(
                    worker_id.clone(),
                    settings.call_timeout,
                    events.clone(),
                ),
                connect_timeout: settings.connect_timeout,
                lifecycle: Mutex::new(ConnectionLifecycle::new(&worker_id)),
                observations: Mutex::new(Vec::new()),
                terminal: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                notify: Mutex::new(()),
                attach_replay: Mutex::new(None),
                shutdown,
                events,
                worker_id,
            }
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.channel.endpoint()
    }

    /// Lifecycle state of the session.
    ///
    /// This tracks the session, not the socket: when a live transport drops
    /// the state stays `Connected` (or `Stopping`) while later attempts
    /// redial, even if those redials are refused. Use
    /// [`transport_connected`](Self::transport_connected) for the socket.
    pub fn state(&self) -> ConnectionState {
        lock(&self.lifecycle).state()
    }

    /// Whether a live transport is up right now
    pub fn transport_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.lifecycle).is_shutdown()
    }

    /// Every state change so far, oldest first
    pub fn transitions(&self) -> Vec<StateTransition> {
        lock(&self.lifecycle).history().to_vec()
    }

    /// Every classified failure so far, terminal or not
    pub fn observations(&self) -> Vec<FailureObservation> {
        lock(&self.observations).clone()
    }

    /// The failure that shut the connection down, if one did
    pub fn terminal_failure(&self) -> Option<ConnectionFailureEvent> {
        lock(&self.terminal).clone()
    }

    /// Subscribe to connection-failure events.
    ///
    /// A listener added after the connection failed is not told about it.
    /// Listeners run after every internal lock is released, so they may call
    /// back into the manager.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        lock(&self.listeners).push(listener);
    }

    /// Re-send this Attach on every transport dialed from now on.
    ///
    /// Workers serve work only on a connection that attached itself, so a
    /// redial after a transient drop must attach again before its call.
    pub fn remember_attach(&self, call_name: &str, body: Value, check: fn(&Value) -> ResponseCheck) {
        *lock(&self.attach_replay) = Some(AttachReplay {
            call: call_name.to_string(),
            body,
            check,
        });
    }

    /// Dial the worker now instead of on the first call
    pub async fn connect(&self) -> Result<(), ConnectError> {
        match self.ensure_connected().await {
            Ok(()) => Ok(()),
            Err(AttemptFailure::Raw(raw)) => {
                let kind = classify(&raw);
                let detail = raw.detail();
                self.report_failure(FailureObservation::new(kind, detail.clone()));
                Err(ConnectError::ConnectionFailed {
                    worker_id: self.worker_id.clone(),
                    kind,
                    detail,
                })
            }
            Err(_) => Err(ConnectError::ConnectionShutdown(self.worker_id.clone())),
        }
    }

    /// Run a named call under `policy`.
    ///
    /// A call issued after the connection shut down makes no attempt and
    /// comes back cancelled.
    pub async fn begin_call<C>(
        &self,
        call_name: &str,
        body: Value,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        check: C,
    ) -> CallOutcome
    where
        C: Fn(&Value) -> ResponseCheck,
    {
        if self.is_shutdown() {
            debug!(
                "Refusing {} to {}: connection is shut down",
                call_name, self.worker_id
            );
            return CallOutcome::rejected(call_name);
        }

        self.dispatcher
            .dispatch(
                call_name,
                policy,
                cancel,
                self,
                |_| self.attempt(call_name, body.clone()),
                check,
            )
            .await
    }

    async fn attempt(&self, call_name: &str, body: Value) -> Result<Value, AttemptFailure> {
        if self.is_shutdown() {
            return Err(AttemptFailure::Rejected);
        }
        self.ensure_connected().await?;

        match self.channel.call(call_name, body).await? {
            CallResult::Ok { value } => Ok(value),
            CallResult::Err { error } => Err(AttemptFailure::Remote(error)),
        }
    }

    async fn ensure_connected(&self) -> Result<(), AttemptFailure> {
        if self.channel.is_connected() {
            return Ok(());
        }
        let mut dialing = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.is_shutdown() {
                return Err(AttemptFailure::Rejected);
            }
            DialGuard {
                lifecycle: &self.lifecycle,
                armed: lifecycle.on_connecting().is_some(),
            }
        };

        let endpoint = self.channel.endpoint().to_string();
        self.events
            .event(EventId::WorkerConnecting)
            .field("worker", &self.worker_id)
            .field("endpoint", &endpoint)
            .emit();

        // A failed dial is settled by the failure report, not the guard
        let dialed = self.channel.connect(self.connect_timeout).await;
        dialing.armed = false;
        dialed?;

        let connected = {
            let mut lifecycle = lock(&self.lifecycle);
            // Another caller's abandoned dial may have reset the state
            if lifecycle.state() == ConnectionState::Created {
                lifecycle.on_connecting();
            }
            lifecycle.on_connected().is_some()
        };
        if connected {
            self.events
                .event(EventId::WorkerConnected)
                .field("worker", &self.worker_id)
                .field("endpoint", &endpoint)
                .emit();
        }

        let replay = lock(&self.attach_replay).clone();
        match replay {
            Some(replay) => self.replay_attach(replay).await,
            None => Ok(()),
        }
    }

    async fn replay_attach(&self, replay: AttachReplay) -> Result<(), AttemptFailure> {
        match self.channel.call(&replay.call, replay.body).await? {
            CallResult::Ok { value } => match (replay.check)(&value) {
                ResponseCheck::Accept => {
                    debug!("Re-attached to {} on a new transport", self.worker_id)
                }
                ResponseCheck::Reject(failure) => {
                    debug!("Re-attach to {} refused: {}", self.worker_id, failure)
                }
                ResponseCheck::Terminal(raw) => return Err(AttemptFailure::Raw(raw)),
            },
            CallResult::Err { error } => {
                debug!("Re-attach to {} failed: {}", self.worker_id, error.message)
            }
        }
        Ok(())
    }

    /// Connected → Stopping, once the worker acknowledged exit
    pub fn begin_stopping(&self) {
        if lock(&self.lifecycle).on_stopping().is_some() {
            debug!("Connection to {} is stopping", self.worker_id);
        }
    }

    /// Close the connection. Idempotent; never publishes a failure event.
    pub async fn close(&self) {
        let transition = lock(&self.lifecycle).on_shutdown();
        self.channel.close().await;

        if transition.is_some() {
            info!("Closed connection to worker {}", self.worker_id);
            self.events
                .event(EventId::ConnectionClosed)
                .field("worker", &self.worker_id)
                .emit();
            self.shutdown.send_replace(true);
        }
    }

    /// Resolves once the connection reaches `Shutdown`
    pub async fn completion(&self) {
        let mut done = self.shutdown.subscribe();
        let _ = done.wait_for(|shut| *shut).await;
    }

    fn on_failure(&self, observation: FailureObservation) {
        let ordered = lock(&self.notify);

        let event = {
            let mut lifecycle = lock(&self.lifecycle);
            lock(&self.observations).push(observation.clone());

            if !observation.kind.is_terminal() {
                if lifecycle.on_connect_failed().is_some() {
                    debug!(
                        "Dial to {} failed ({}); will redial",
                        self.worker_id, observation.detail
                    );
                }
                None
            } else {
                lifecycle.on_shutdown().map(|transition| ConnectionFailureEvent {
                    worker_id: self.worker_id.clone(),
                    kind: observation.kind,
                    detail: observation.detail.clone(),
                    previous_state: transition.from,
                    timestamp: observation.timestamp,
                })
            }
        };

        let Some(event) = event else {
            debug!(
                "Observed {} on {} without state change: {}",
                observation.kind, self.worker_id, observation.detail
            );
            return;
        };

        *lock(&self.terminal) = Some(event.clone());
        self.channel.abort();
        self.events
            .event(EventId::ConnectionFailure)
            .field("worker", &self.worker_id)
            .field("kind", event.kind)
            .field("detail", &event.detail)
            .emit();
        self.shutdown.send_replace(true);

        // At most one terminal event exists, so releasing the ordering lock
        // before the callbacks cannot reorder notifications
        let listeners: Vec<_> = lock(&self.listeners).clone();
        drop(ordered);
        for listener in listeners {
            listener.on_connection_failure(&event);
        }
    }
}

/// Returns the lifecycle from `Connecting` to `Created` when a dial is
/// abandoned, e.g. because the caller's cancellation dropped the attempt
struct DialGuard<'a> {
    lifecycle: &'a Mutex<ConnectionLifecycle>,
    armed: bool,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.lifecycle).on_connect_failed();
        }
    }
}

impl FailureReporter for ConnectionManager {
    fn report_failure(&self, observation: FailureObservation) {
        self.on_failure(observation);
    }
}

impl ChannelEventSink for ConnectionManager {
    fn on_channel_event(&self, raw: RawOutcome) {
        self.on_failure(FailureObservation::from_raw(&raw));
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("worker_id", &self.worker_id)
            .field("state", &self.state())
            .field("channel", &self.channel)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
