//! Worker-side session server.
//!
//! The server accepts orchestrator connections, validates the identity
//! carried by `Attach`, acknowledges `Exit` and routes every other call to a
//! registered [`WorkHandler`]. Each connection gets its own task and each
//! work call runs on a task of its own, so slow calls do not hold up the
//! control calls behind them.

use crate::error::WorkerError;
use crate::lifecycle::{WorkerLifecycle, WorkerState};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tether_connect::{
    classify, ConnectionFailureEvent, ConnectionListener, ConnectionState, RawOutcome,
};
use tether_observability::{EventId, EventLogger};
use tether_proto::{
    calls, read_frame, write_frame, AttachRequest, AttachResponse, CallResult, CloseReason,
    Envelope, ExitAck, ExitRequest, IdentityMatch, InvocationIdentity, ProtoError, RejectionKind,
    RemoteError, RemoteErrorKind, PROTOCOL_VERSION,
};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Decision on an incoming Attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachVerdict {
    Accept,
    /// Environment differs; the connection stays open
    TolerableReject(String),
    /// Session differs; the connection is closed after the answer
    HardReject(String),
}

impl AttachVerdict {
    pub fn as_str(&self) -> &str {
        match self {
            AttachVerdict::Accept => "accepted",
            AttachVerdict::TolerableReject(_) => "tolerable rejection",
            AttachVerdict::HardReject(_) => "hard rejection",
        }
    }

    fn to_response(&self) -> AttachResponse {
        match self {
            AttachVerdict::Accept => AttachResponse::accepted(),
            AttachVerdict::TolerableReject(reason) => {
                AttachResponse::rejected(RejectionKind::Tolerable, reason.clone())
            }
            AttachVerdict::HardReject(reason) => {
                AttachResponse::rejected(RejectionKind::Hard, reason.clone())
            }
        }
    }
}

/// Executes named work calls for an attached session
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, call: &str, body: Value) -> Result<Value, RemoteError>;
}

/// Handler for calls nobody registered
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedHandler;

#[async_trait]
impl WorkHandler for UnsupportedHandler {
    async fn handle(&self, call: &str, _body: Value) -> Result<Value, RemoteError> {
        Err(RemoteError {
            kind: RemoteErrorKind::UnknownCall,
            message: format!("no handler registered for {}", call),
        })
    }
}

/// How a connection task ended
enum ConnectionEnd {
    /// Orderly: goodbye, hard reject answered, or server shutdown
    Clean,
    /// Anything else; reported to listeners
    Abnormal(RawOutcome),
}

/// The worker's half of a session
pub struct WorkerServer {
    identity: InvocationIdentity,
    handlers: HashMap<String, Arc<dyn WorkHandler>>,
    fallback: Arc<dyn WorkHandler>,
    lifecycle: Mutex<WorkerLifecycle>,
    failures: Mutex<Vec<ConnectionFailureEvent>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    exited: watch::Sender<bool>,
    connections: watch::Sender<usize>,
    events: EventLogger,
}

impl WorkerServer {
    pub fn new(identity: InvocationIdentity, events: EventLogger) -> Self {
        let (exited, _) = watch::channel(false);
        let (connections, _) = watch::channel(0);
        Self {
            lifecycle: Mutex::new(WorkerLifecycle::new(&identity.session_id)),
            identity,
            handlers: HashMap::new(),
            fallback: Arc::new(UnsupportedHandler),
            failures: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            exited,
            connections,
            events,
        }
    }

    /// Route `call` to `handler`
    pub fn with_handler(mut self, call: impl Into<String>, handler: Arc<dyn WorkHandler>) -> Self {
        self.handlers.insert(call.into(), handler);
        self
    }

    /// Handler for every call without a dedicated one
    pub fn with_fallback(mut self, handler: Arc<dyn WorkHandler>) -> Self {
        self.fallback = handler;
        self
    }

    pub fn identity(&self) -> &InvocationIdentity {
        &self.identity
    }

    pub fn state(&self) -> WorkerState {
        lock(&self.lifecycle).state()
    }

    pub fn active_calls(&self) -> u32 {
        lock(&self.lifecycle).active_calls()
    }

    /// Abnormal connection ends seen so far
    pub fn failure_events(&self) -> Vec<ConnectionFailureEvent> {
        lock(&self.failures).clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        lock(&self.listeners).push(listener);
    }

    /// Validate an Attach against the local identity.
    ///
    /// A session mismatch is a hard rejection whatever the environment.
    pub fn on_attach(&self, request: &AttachRequest) -> AttachVerdict {
        let remote = request.identity();
        let verdict = match self.identity.compare(&remote) {
            IdentityMatch::UnrecoverableMismatch => AttachVerdict::HardReject(format!(
                "session {} does not match local session {}",
                remote.session_id, self.identity.session_id
            )),
            IdentityMatch::TolerableMismatch => AttachVerdict::TolerableReject(format!(
                "environment {} does not match local environment {}",
                remote.environment, self.identity.environment
            )),
            IdentityMatch::Identical => {
                let mut lifecycle = lock(&self.lifecycle);
                match lifecycle.state() {
                    WorkerState::Idle => {
                        lifecycle.on_attached();
                        AttachVerdict::Accept
                    }
                    WorkerState::Attached => AttachVerdict::Accept,
                    WorkerState::Exited | WorkerState::Shutdown => AttachVerdict::TolerableReject(
                        "session already exited on this worker".to_string(),
                    ),
                }
            }
        };

        self.events
            .event(EventId::AttachReceived)
            .field("peer", &request.call_metadata.sender)
            .field("verdict", verdict.as_str())
            .emit();
        verdict
    }

    /// Record an Exit and release the session
    pub fn on_exit(&self, request: &ExitRequest) -> ExitAck {
        if request.session_id != self.identity.session_id {
            warn!(
                "Ignoring exit for foreign session {} (local {})",
                request.session_id, self.identity.session_id
            );
            return ExitAck {
                acknowledged: false,
            };
        }

        let transition = lock(&self.lifecycle).on_exited();
        if transition.is_some() {
            self.events
                .event(EventId::ExitReceived)
                .field("session", &request.session_id)
                .emit();
            self.exited.send_replace(true);
        }
        // A repeated Exit is acknowledged again
        ExitAck {
            acknowledged: self.state() == WorkerState::Exited,
        }
    }

    pub fn is_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolves once the orchestrator has sent Exit
    pub async fn completion(&self) {
        let mut exited = self.exited.subscribe();
        let _ = exited.wait_for(|done| *done).await;
    }

    pub fn open_connections(&self) -> usize {
        *self.connections.borrow()
    }

    /// Resolves once no orchestrator connection is open
    pub async fn idle(&self) {
        let mut open = self.connections.subscribe();
        let _ = open.wait_for(|n| *n == 0).await;
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), WorkerError> {
        let address = listener.local_addr()?;
        self.events
            .event(EventId::WorkerServerListening)
            .field("address", address)
            .field("session", &self.identity.session_id)
            .emit();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Accept failed on {}: {}", address, e);
                            continue;
                        }
                    };
                    debug!("Connection from {}", peer);
                    let server = self.clone();
                    let token = shutdown.child_token();
                    self.connections.send_modify(|n| *n += 1);
                    tokio::spawn(async move {
                        server.clone().handle_connection(stream, peer, token).await;
                        server.connections.send_modify(|n| *n = n.saturating_sub(1));
                    });
                }
            }
        }

        if lock(&self.lifecycle).on_shutdown().is_some() {
            info!("Worker for session {} stopped", self.identity.session_id);
        }
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let end = match self.run_connection(stream, &cancel).await {
            Ok(end) => end,
            Err(e) => ConnectionEnd::Abnormal(e.into()),
        };

        match end {
            ConnectionEnd::Clean => debug!("Connection from {} closed", peer),
            ConnectionEnd::Abnormal(raw) => self.record_failure(peer, raw),
        }
    }

    async fn run_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        cancel: &CancellationToken,
    ) -> Result<ConnectionEnd, ProtoError> {
        stream.set_nodelay(true)?;
        let (mut read, write) = stream.into_split();
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(write));

        match read_frame(&mut read).await? {
            Some(Envelope::Hello { protocol_version, peer }) if protocol_version == PROTOCOL_VERSION => {
                debug!("Greeted by {}", peer);
                send(&writer, &Envelope::HelloAck { protocol_version }).await?;
            }
            Some(Envelope::Hello { protocol_version, .. }) => {
                let detail = format!(
                    "protocol {} not supported (worker speaks {})",
                    protocol_version, PROTOCOL_VERSION
                );
                close_with(&writer, CloseReason::Protocol { detail: detail.clone() }).await;
                return Ok(ConnectionEnd::Abnormal(RawOutcome::ProtocolViolation(detail)));
            }
            Some(_) => {
                let detail = "first frame was not hello".to_string();
                close_with(&writer, CloseReason::Protocol { detail: detail.clone() }).await;
                return Ok(ConnectionEnd::Abnormal(RawOutcome::ProtocolViolation(detail)));
            }
            None => return Ok(ConnectionEnd::Clean),
        }

        // Work is served only on a connection whose own Attach was accepted;
        // a redialed transport must attach again
        let mut attached = false;
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    close_with(&writer, CloseReason::Shutdown {
                        detail: "worker stopping".to_string(),
                    }).await;
                    return Ok(ConnectionEnd::Clean);
                }
                frame = read_frame(&mut read) => frame,
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(e @ (ProtoError::Malformed(_) | ProtoError::FrameTooLarge { .. })) => {
                    close_with(&writer, CloseReason::Protocol { detail: e.to_string() }).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            match frame {
                Some(Envelope::Request { id, call, body }) if call == calls::ATTACH => {
                    let request = match decode::<AttachRequest>(body) {
                        Ok(request) => request,
                        Err(error) => {
                            let result = CallResult::Err { error };
                            send(&writer, &Envelope::Response { id, result }).await?;
                            continue;
                        }
                    };
                    let verdict = self.on_attach(&request);
                    attached |= verdict == AttachVerdict::Accept;
                    let result = CallResult::ok(&verdict.to_response())?;
                    send(&writer, &Envelope::Response { id, result }).await?;

                    if let AttachVerdict::HardReject(detail) = verdict {
                        let reason = CloseReason::IdentityMismatch {
                            session_mismatch: true,
                            detail,
                        };
                        close_with(&writer, reason).await;
                        return Ok(ConnectionEnd::Clean);
                    }
                }
                Some(Envelope::Request { id, call, body }) if call == calls::EXIT => {
                    let result = match decode::<ExitRequest>(body) {
                        Ok(request) => CallResult::ok(&self.on_exit(&request))?,
                        Err(err) => CallResult::Err { error: err },
                    };
                    send(&writer, &Envelope::Response { id, result }).await?;
                }
                Some(Envelope::Request { id, call, body }) => {
                    self.spawn_work(id, call, body, attached, writer.clone());
                }
                Some(Envelope::Close {
                    reason: CloseReason::Goodbye,
                }) => return Ok(ConnectionEnd::Clean),
                // Dropping the transport outside an attached session is normal
                None if !attached || self.state() != WorkerState::Attached => {
                    return Ok(ConnectionEnd::Clean)
                }
                Some(Envelope::Close { reason }) => {
                    return Ok(ConnectionEnd::Abnormal(RawOutcome::PeerClosed(reason)));
                }
                None => {
                    return Ok(ConnectionEnd::Abnormal(RawOutcome::io(
                        io::ErrorKind::UnexpectedEof,
                        "orchestrator disconnected without exiting",
                    )));
                }
                Some(other) => {
                    let detail = format!("unexpected frame {:?}", other);
                    close_with(&writer, CloseReason::Protocol { detail: detail.clone() }).await;
                    return Ok(ConnectionEnd::Abnormal(RawOutcome::ProtocolViolation(detail)));
                }
            }
        }
    }

    fn spawn_work(
        self: &Arc<Self>,
        id: u64,
        call: String,
        body: Value,
        attached: bool,
        writer: SharedWriter,
    ) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            let refusal = if !attached {
                Some("this connection has not attached")
            } else if !lifecycle.accepts_work() {
                Some("no attached session")
            } else {
                None
            };
            if let Some(reason) = refusal {
                drop(lifecycle);
                let result = CallResult::err(
                    RemoteErrorKind::NotAttached,
                    format!("{} refused: {}", call, reason),
                );
                tokio::spawn(async move {
                    let _ = send(&writer, &Envelope::Response { id, result }).await;
                });
                return;
            }
            lifecycle.call_started();
        }

        let server = self.clone();
        tokio::spawn(async move {
            let handler = server
                .handlers
                .get(&call)
                .cloned()
                .unwrap_or_else(|| server.fallback.clone());
            let result = match handler.handle(&call, body).await {
                Ok(value) => CallResult::Ok { value },
                Err(error) => CallResult::Err { error },
            };
            lock(&server.lifecycle).call_completed();

            if let Err(e) = send(&writer, &Envelope::Response { id, result }).await {
                debug!("Could not deliver response to {} ({}): {}", call, id, e);
            }
        });
    }

    fn record_failure(&self, peer: SocketAddr, raw: RawOutcome) {
        let event = ConnectionFailureEvent {
            worker_id: peer.to_string(),
            kind: classify(&raw),
            detail: raw.detail(),
            previous_state: ConnectionState::Connected,
            timestamp: std::time::SystemTime::now(),
        };
        warn!(
            "Connection from {} ended abnormally ({}): {}",
            peer, event.kind, event.detail
        );
        lock(&self.failures).push(event.clone());

        let listeners: Vec<_> = lock(&self.listeners).clone();
        for listener in listeners {
            listener.on_connection_failure(&event);
        }
    }
}

impl std::fmt::Debug for WorkerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerServer")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

/// Bind the listening socket for [`WorkerServer::serve`]
pub async fn bind(address: &str) -> Result<TcpListener, WorkerError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| WorkerError::Bind {
            address: address.to_string(),
            source,
        })
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T, RemoteError> {
    serde_json::from_value(body).map_err(|e| RemoteError {
        kind: RemoteErrorKind::InvalidPayload,
        message: e.to_string(),
    })
}

async fn send(writer: &SharedWriter, envelope: &Envelope) -> Result<(), ProtoError> {
    let mut writer = writer.lock().await;
    write_frame(&mut *writer, envelope).await
}

/// Best-effort close frame; the connection is going away either way
async fn close_with(writer: &SharedWriter, reason: CloseReason) {
    if let Err(e) = send(writer, &Envelope::Close { reason }).await {
        debug!("Close frame not delivered: {}", e);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
