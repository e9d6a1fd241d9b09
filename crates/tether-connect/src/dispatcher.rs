//! Call dispatcher: attempts, deadlines, retry and cancellation
//!
//! The dispatcher runs one logical call as a series of attempts. Every
//! attempt races the caller's cancellation token against a per-attempt
//! deadline. Connection failures are classified and handed to a
//! [`FailureReporter`] before the retry decision is made, so observers see
//! every failure whether or not the call ends up retrying.

use crate::classifier::{classify, FailureKind, FailureObservation, RawOutcome};
use crate::outcome::{CallFailure, CallOutcome};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tether_observability::{EventId, EventLogger};
use tether_proto::RemoteError;
use tether_resilience::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a single attempt did not produce a response
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    /// The connection was shut down before the attempt could start
    Rejected,
    /// Transport or protocol failure, still to be classified
    Raw(RawOutcome),
    /// The worker answered with an application error
    Remote(RemoteError),
}

impl From<RawOutcome> for AttemptFailure {
    fn from(raw: RawOutcome) -> Self {
        AttemptFailure::Raw(raw)
    }
}

/// Verdict on a response payload that arrived successfully
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseCheck {
    Accept,
    /// Fail the call without classification
    Reject(CallFailure),
    /// Fail the call and report the classified outcome
    Terminal(RawOutcome),
}

/// Receives every classified failure
pub trait FailureReporter: Send + Sync {
    fn report_failure(&self, observation: FailureObservation);
}

/// Executes logical calls for one worker
#[derive(Debug, Clone)]
pub struct CallDispatcher {
    worker_id: String,
    attempt_timeout: Duration,
    events: EventLogger,
}

impl CallDispatcher {
    pub fn new(worker_id: impl Into<String>, attempt_timeout: Duration, events: EventLogger) -> Self {
        Self {
            worker_id: worker_id.into(),
            attempt_timeout,
            events,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Run `attempt` until it succeeds, fails terminally, exhausts `policy`
    /// or `cancel` fires.
    ///
    /// `attempt` receives the 1-based attempt number. `check` inspects each
    /// successful response before the call is declared successful.
    pub async fn dispatch<A, Fut, C>(
        &self,
        call_name: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        reporter: &dyn FailureReporter,
        mut attempt: A,
        check: C,
    ) -> CallOutcome
    where
        A: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Value, AttemptFailure>>,
        C: Fn(&Value) -> ResponseCheck,
    {
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return CallOutcome::cancelled(call_name, attempts, CallFailure::Cancelled);
            }

            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("{} to {} cancelled during attempt {}", call_name, self.worker_id, attempts);
                    return CallOutcome::cancelled(call_name, attempts, CallFailure::Cancelled);
                }
                result = tokio::time::timeout(self.attempt_timeout, attempt(attempts)) => result,
            };

            let raw = match result {
                Err(_) => {
                    let raw = RawOutcome::DeadlineElapsed {
                        deadline: self.attempt_timeout,
                    };
                    reporter.report_failure(FailureObservation::from_raw(&raw));
                    return CallOutcome::cancelled(
                        call_name,
                        attempts,
                        CallFailure::Connection(FailureKind::Timeout),
                    );
                }
                Ok(Ok(response)) => match check(&response) {
                    ResponseCheck::Accept => {
                        return CallOutcome::succeeded(call_name, attempts, response)
                    }
                    ResponseCheck::Reject(failure) => {
                        return CallOutcome::failed(call_name, attempts, failure)
                    }
                    ResponseCheck::Terminal(raw) => raw,
                },
                Ok(Err(AttemptFailure::Rejected)) => {
                    return CallOutcome::cancelled(
                        call_name,
                        attempts - 1,
                        CallFailure::ChannelShutdown,
                    );
                }
                Ok(Err(AttemptFailure::Remote(err))) => {
                    return CallOutcome::failed(call_name, attempts, CallFailure::Remote(err));
                }
                Ok(Err(AttemptFailure::Raw(raw))) => raw,
            };

            let kind = classify(&raw);
            reporter.report_failure(FailureObservation::new(kind, raw.detail()));

            if kind == FailureKind::Timeout {
                return CallOutcome::cancelled(call_name, attempts, CallFailure::Connection(kind));
            }
            if !kind.is_retryable() || !policy.allows_retry_after(attempts) {
                return CallOutcome::failed(call_name, attempts, CallFailure::Connection(kind));
            }

            let delay = policy.delay_for(attempts);
            self.events
                .event(EventId::CallRetry)
                .field("call", call_name)
                .field("worker", &self.worker_id)
                .field("attempt", attempts)
                .field("kind", kind)
                .field("delayMs", delay.as_millis())
                .emit();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return CallOutcome::cancelled(call_name, attempts, CallFailure::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::CallState;
    use serde_json::json;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tether_observability::EventCapture;
    use tether_proto::RemoteErrorKind;
    use tether_resilience::BackoffStrategy;

    #[derive(Default)]
    struct Reports(Mutex<Vec<FailureObservation>>);

    impl Reports {
        fn kinds(&self) -> Vec<FailureKind> {
            self.0.lock().unwrap().iter().map(|o| o.kind).collect()
        }
    }

    impl FailureReporter for Reports {
        fn report_failure(&self, observation: FailureObservation) {
            self.0.lock().unwrap().push(observation);
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff: BackoffStrategy::Fixed,
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    fn refused() -> AttemptFailure {
        AttemptFailure::Raw(RawOutcome::io(io::ErrorKind::ConnectionRefused, "refused"))
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let dispatcher = CallDispatcher::new("w-1", Duration::from_secs(5), EventLogger::disabled());
        let reports = Reports::default();

        let outcome = dispatcher
            .dispatch(
                "Echo",
                &fast_policy(3),
                &CancellationToken::new(),
                &reports,
                |_| async { Ok(json!({"ok": true})) },
                |_| ResponseCheck::Accept,
            )
            .await;

        assert!(outcome.succeeded);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.response, Some(json!({"ok": true})));
        assert!(reports.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_success() {
        let capture = EventCapture::new();
        let dispatcher = CallDispatcher::new("w-1", Duration::from_secs(5), capture.logger());
        let reports = Reports::default();
        let calls = AtomicU32::new(0);

        let outcome = dispatcher
            .dispatch(
                "Echo",
                &fast_policy(3),
                &CancellationToken::new(),
                &reports,
                |n| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 3 {
                            Err(refused())
                        } else {
                            Ok(Value::Null)
                        }
                    }
                },
                |_| ResponseCheck::Accept,
            )
            .await;

        assert!(outcome.succeeded);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            reports.kinds(),
            vec![FailureKind::TransientConnectionError; 2]
        );
        assert_eq!(capture.count(EventId::CallRetry), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_budget() {
        let dispatcher = CallDispatcher::new("w-1", Duration::from_secs(5), EventLogger::disabled());
        let reports = Reports::default();

        let outcome = dispatcher
            .dispatch(
                "Echo",
                &fast_policy(2),
                &CancellationToken::new(),
                &reports,
                |_| async { Err(refused()) },
                |_| ResponseCheck::Accept,
            )
            .await;

        assert_eq!(outcome.final_state, CallState::Failed);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(
            outcome.failure_kind(),
            Some(FailureKind::TransientConnectionError)
        );
    }

    #[tokio::test]
    async fn test_remote_shutdown_is_not_retried() {
        let dispatcher = CallDispatcher::new("w-1", Duration::from_secs(5), EventLogger::disabled());
        let reports = Reports::default();

        let outcome = dispatcher
            .dispatch(
                "Echo",
                &fast_policy(5),
                &CancellationToken::new(),
                &reports,
                |_| async {
                    Err(AttemptFailure::Raw(RawOutcome::ProtocolViolation(
                        "garbage".to_string(),
                    )))
                },
                |_| ResponseCheck::Accept,
            )
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.failure_kind(), Some(FailureKind::RemoteShutdown));
        assert_eq!(reports.kinds(), vec![FailureKind::RemoteShutdown]);
    }

    #[tokio::test]
    async fn test_attempt_deadline_is_timeout() {
        let dispatcher = CallDispatcher::new("w-1", Duration::from_millis(50), EventLogger::disabled());
        let reports = Reports::default();

        let outcome = dispatcher
            .dispatch(
                "Slow",
                &fast_policy(3),
                &CancellationToken::new(),
                &reports,
                |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                },
                |_| ResponseCheck::Accept,
            )
            .await;

        assert_eq!(outcome.final_state, CallState::Cancelled);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Timeout));
        assert_eq!(reports.kinds(), vec![FailureKind::Timeout]);
    }

    #[tokio::test]
    async fn test_cancellation_during_attempt() {
        let dispatcher = CallDispatcher::new("w-1", Duration::from_secs(60), EventLogger::disabled());
        let reports = Reports::default();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = dispatcher
            .dispatch(
                "Slow",
                &fast_policy(3),
                &cancel,
                &reports,
                |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                },
                |_| ResponseCheck::Accept,
            )
            .await;

        assert_eq!(outcome.final_state, CallState::Cancelled);
        assert_eq!(outcome.failure, Some(CallFailure::Cancelled));
        assert!(reports.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_precancelled_makes_no_attempt() {
        let dispatcher = CallDispatcher::new("w-1", Duration::from_secs(5), EventLogger::disabled());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = dispatcher
            .dispatch(
                "Echo",
                &fast_policy(3),
                &cancel,
                &Reports::default(),
                |_| async { Ok(Value::Null) },
                |_| ResponseCheck::Accept,
            )
            .await;

        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.final_state, CallState::Cancelled);
    }

    #[tokio::test]
    async fn test_rejected_attempt_is_not_counted() {
        let dispatcher = CallDispatcher::new("w-1", Duration::from_secs(5), EventLogger::disabled());

        let outcome = dispatcher
            .dispatch(
                "Echo",
                &fast_policy(3),
                &CancellationToken::new(),
                &Reports::default(),
                |_| async { Err(AttemptFailure::Rejected) },
                |_| ResponseCheck::Accept,
            )
            .await;

        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.failure, Some(CallFailure::ChannelShutdown));
    }

    #[tokio::test]
    async fn test_remote_error_is_not_classified() {
        let dispatcher = CallDispatcher::new("w-1", Duration::from_secs(5), EventLogger::disabled());
        let reports = Reports::default();

        let outcome = dispatcher
            .dispatch(
                "Missing",
                &fast_policy(3),
                &CancellationToken::new(),
                &reports,
                |_| async {
                    Err(AttemptFailure::Remote(RemoteError {
                        kind: RemoteErrorKind::UnknownCall,
                        message: "no handler".to_string(),
                    }))
                },
                |_| ResponseCheck::Accept,
            )
            .await;

        assert_eq!(outcome.final_state, CallState::Failed);
        assert!(matches!(outcome.failure, Some(CallFailure::Remote(_))));
        assert!(reports.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_response_checks() {
        let dispatcher = CallDispatcher::new("w-1", Duration::from_secs(5), EventLogger::disabled());
        let reports = Reports::default();

        let soft = dispatcher
            .dispatch(
                "Attach",
                &fast_policy(3),
                &CancellationToken::new(),
                &reports,
                |_| async { Ok(Value::Null) },
                |_| {
                    ResponseCheck::Reject(CallFailure::SoftIdentityMismatch {
                        reason: "env".to_string(),
                    })
                },
            )
            .await;
        assert_eq!(soft.final_state, CallState::Failed);
        assert!(reports.kinds().is_empty());

        let hard = dispatcher
            .dispatch(
                "Attach",
                &fast_policy(3),
                &CancellationToken::new(),
                &reports,
                |_| async { Ok(Value::Null) },
                |_| {
                    ResponseCheck::Terminal(RawOutcome::IdentityRefused {
                        session_mismatch: true,
                        detail: "session".to_string(),
                    })
                },
            )
            .await;
        assert_eq!(hard.attempts, 1);
        assert_eq!(hard.failure_kind(), Some(FailureKind::UnrecoverableFailure));
        assert_eq!(reports.kinds(), vec![FailureKind::UnrecoverableFailure]);
    }
}
