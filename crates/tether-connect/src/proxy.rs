//! WorkerProxy: the orchestrator's typed handle to one worker

use crate::channel::Endpoint;
use crate::classifier::RawOutcome;
use crate::dispatcher::ResponseCheck;
use crate::error::ConnectError;
use crate::listener::ConnectionListener;
use crate::manager::{ConnectionManager, ConnectionSettings};
use crate::outcome::{CallFailure, CallOutcome};
use crate::state::ConnectionState;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tether_observability::{EventId, EventLogger};
use tether_proto::{
    calls, AttachRequest, AttachResponse, ExitAck, ExitRequest, InvocationIdentity, RejectionKind,
    RemoteError, RemoteErrorKind,
};
use tether_resilience::RetryPolicy;
use tokio_util::sync::CancellationToken;

/// Settings for one proxy
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub connection: ConnectionSettings,
    /// Retry policy for Exit and work calls; Attach always gets one attempt
    pub retry: RetryPolicy,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ProxySettings {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connection.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.connection.call_timeout = timeout;
        self
    }
}

/// Handle to one worker, speaking Attach, Exit and named work calls.
///
/// Dropping the proxy releases its connection.
#[derive(Debug)]
pub struct WorkerProxy {
    identity: InvocationIdentity,
    manager: Arc<ConnectionManager>,
    retry: RetryPolicy,
    sender: String,
    events: EventLogger,
}

impl WorkerProxy {
    pub fn new(
        worker_id: impl Into<String>,
        endpoint: Endpoint,
        identity: InvocationIdentity,
        settings: ProxySettings,
        events: EventLogger,
    ) -> Result<Self, ConnectError> {
        settings.retry.validate()?;
        let sender = settings.connection.local_name.clone();
        let manager = ConnectionManager::new(worker_id, endpoint, settings.connection, events.clone());
        Ok(Self {
            identity,
            manager,
            retry: settings.retry,
            sender,
            events,
        })
    }

    pub fn worker_id(&self) -> &str {
        self.manager.worker_id()
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.manager.endpoint()
    }

    pub fn identity(&self) -> &InvocationIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.manager.add_listener(listener);
    }

    /// Dial now instead of on the first call
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.manager.connect().await
    }

    /// Bind the worker to this orchestrator's session
    pub async fn attach(&self) -> CallOutcome {
        self.attach_with_cancel(&CancellationToken::new()).await
    }

    /// Attach with one attempt only.
    ///
    /// A tolerable rejection fails the call and leaves the connection up; a
    /// hard rejection fails the call and shuts the connection down.
    pub async fn attach_with_cancel(&self, cancel: &CancellationToken) -> CallOutcome {
        let request = AttachRequest::new(&self.identity, self.sender.clone());
        let body = match serde_json::to_value(&request) {
            Ok(body) => body,
            Err(e) => return encode_failure(calls::ATTACH, e),
        };

        let outcome = self
            .manager
            .begin_call(
                calls::ATTACH,
                body.clone(),
                &self.retry.with_max_attempts(1),
                cancel,
                check_attach,
            )
            .await;

        match &outcome.failure {
            None => {
                self.manager.remember_attach(calls::ATTACH, body, check_attach);
                self.events
                    .event(EventId::WorkerAttached)
                    .field("worker", self.worker_id())
                    .field("session", &self.identity.session_id)
                    .emit()
            }
            Some(CallFailure::SoftIdentityMismatch { reason }) => self
                .events
                .event(EventId::WorkerAttachRejected)
                .field("worker", self.worker_id())
                .field("rejection", "tolerable")
                .field("reason", reason)
                .emit(),
            Some(_) => {}
        }
        outcome
    }

    /// Ask the worker to end the session
    pub async fn exit(&self) -> CallOutcome {
        self.exit_with_cancel(&CancellationToken::new()).await
    }

    pub async fn exit_with_cancel(&self, cancel: &CancellationToken) -> CallOutcome {
        let request = ExitRequest {
            session_id: self.identity.session_id.clone(),
        };
        let body = match serde_json::to_value(&request) {
            Ok(body) => body,
            Err(e) => return encode_failure(calls::EXIT, e),
        };

        let outcome = self
            .manager
            .begin_call(calls::EXIT, body, &self.retry, cancel, check_exit)
            .await;

        if outcome.succeeded {
            self.manager.begin_stopping();
            self.events
                .event(EventId::WorkerExited)
                .field("worker", self.worker_id())
                .emit();
        }
        outcome
    }

    /// Run a named work call
    pub async fn call(&self, call_name: &str, payload: Value) -> CallOutcome {
        self.call_with_cancel(call_name, payload, &CancellationToken::new())
            .await
    }

    pub async fn call_with_cancel(
        &self,
        call_name: &str,
        payload: Value,
        cancel: &CancellationToken,
    ) -> CallOutcome {
        self.manager
            .begin_call(call_name, payload, &self.retry, cancel, |_| {
                ResponseCheck::Accept
            })
            .await
    }

    /// Close the connection; idempotent
    pub async fn close(&self) {
        self.manager.close().await;
    }

    /// Resolves once the connection is shut down
    pub async fn completion(&self) {
        self.manager.completion().await;
    }
}

fn check_attach(response: &Value) -> ResponseCheck {
    let response: AttachResponse = match serde_json::from_value(response.clone()) {
        Ok(r) => r,
        Err(e) => {
            return ResponseCheck::Terminal(RawOutcome::ProtocolViolation(format!(
                "malformed attach response: {}",
                e
            )))
        }
    };

    if response.accepted {
        return ResponseCheck::Accept;
    }
    match response.rejection_kind {
        RejectionKind::Hard => ResponseCheck::Terminal(RawOutcome::IdentityRefused {
            session_mismatch: true,
            detail: response.reason_text,
        }),
        RejectionKind::Tolerable | RejectionKind::None => {
            ResponseCheck::Reject(CallFailure::SoftIdentityMismatch {
                reason: response.reason_text,
            })
        }
    }
}

fn check_exit(response: &Value) -> ResponseCheck {
    match serde_json::from_value::<ExitAck>(response.clone()) {
        Ok(ack) if ack.acknowledged => ResponseCheck::Accept,
        Ok(_) => ResponseCheck::Reject(CallFailure::Remote(RemoteError {
            kind: RemoteErrorKind::HandlerFailed,
            message: "worker did not acknowledge exit".to_string(),
        })),
        Err(e) => ResponseCheck::Terminal(RawOutcome::ProtocolViolation(format!(
            "malformed exit response: {}",
            e
        ))),
    }
}

fn encode_failure(call_name: &str, err: serde_json::Error) -> CallOutcome {
    CallOutcome::failed(
        call_name,
        0,
        CallFailure::Remote(RemoteError {
            kind: RemoteErrorKind::InvalidPayload,
            message: err.to_string(),
        }),
    )
}
