//! Failure classification
//!
//! Raw transport and protocol outcomes are mapped onto a small, fixed set of
//! failure kinds. Only the kind decides retry and teardown; the raw outcome
//! survives as the observation's detail text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::{Duration, SystemTime};
use tether_proto::{CloseReason, ProtoError};

/// Failure kinds, in the order the classifier tests for them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No response within the configured deadline
    Timeout,
    /// Hard identity mismatch or equivalent protocol-level refusal
    UnrecoverableFailure,
    /// Network-level hiccup; the only retryable kind
    TransientConnectionError,
    /// The peer closed the channel
    RemoteShutdown,
}

impl FailureKind {
    pub fn as_str(&self) -> &str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::UnrecoverableFailure => "unrecoverable_failure",
            FailureKind::TransientConnectionError => "transient_connection_error",
            FailureKind::RemoteShutdown => "remote_shutdown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::TransientConnectionError)
    }

    /// Whether this kind tears the connection down
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unclassified outcome of a connect or call attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutcome {
    /// The attempt's deadline fired before the peer answered
    DeadlineElapsed { deadline: Duration },

    /// The peer answered an identity check with a refusal
    IdentityRefused {
        session_mismatch: bool,
        detail: String,
    },

    /// The peer sent an explicit close frame
    PeerClosed(CloseReason),

    /// The byte stream carried something that is not a valid frame
    ProtocolViolation(String),

    /// Any other transport failure
    Io { kind: io::ErrorKind, detail: String },
}

impl RawOutcome {
    pub fn io(kind: io::ErrorKind, detail: impl Into<String>) -> Self {
        RawOutcome::Io {
            kind,
            detail: detail.into(),
        }
    }

    pub fn detail(&self) -> String {
        match self {
            RawOutcome::DeadlineElapsed { deadline } => {
                format!("no response within {}ms", deadline.as_millis())
            }
            RawOutcome::IdentityRefused { detail, .. } => format!("identity refused: {}", detail),
            RawOutcome::PeerClosed(reason) => format!("peer closed channel: {}", reason.detail()),
            RawOutcome::ProtocolViolation(detail) => format!("protocol violation: {}", detail),
            RawOutcome::Io { kind, detail } => format!("{:?}: {}", kind, detail),
        }
    }
}

impl From<io::Error> for RawOutcome {
    fn from(err: io::Error) -> Self {
        RawOutcome::Io {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

impl From<ProtoError> for RawOutcome {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Io(e) => e.into(),
            ProtoError::Truncated => {
                RawOutcome::io(io::ErrorKind::UnexpectedEof, "stream ended mid-frame")
            }
            other => RawOutcome::ProtocolViolation(other.to_string()),
        }
    }
}

/// Classify a raw outcome. First match wins:
///
/// 1. deadline elapsed → `Timeout`
/// 2. identity refusal with a session mismatch → `UnrecoverableFailure`
/// 3. any other peer close or protocol problem → `RemoteShutdown`
/// 4. anything else → `TransientConnectionError`
pub fn classify(raw: &RawOutcome) -> FailureKind {
    match raw {
        RawOutcome::DeadlineElapsed { .. } => FailureKind::Timeout,
        RawOutcome::IdentityRefused {
            session_mismatch: true,
            ..
        }
        | RawOutcome::PeerClosed(CloseReason::IdentityMismatch {
            session_mismatch: true,
            ..
        }) => FailureKind::UnrecoverableFailure,
        RawOutcome::IdentityRefused { .. }
        | RawOutcome::PeerClosed(_)
        | RawOutcome::ProtocolViolation(_) => FailureKind::RemoteShutdown,
        RawOutcome::Io { .. } => FailureKind::TransientConnectionError,
    }
}

/// A classified failure; immutable once created
#[derive(Debug, Clone, PartialEq)]
pub struct FailureObservation {
    pub kind: FailureKind,
    pub timestamp: SystemTime,
    pub detail: String,
}

impl FailureObservation {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: SystemTime::now(),
            detail: detail.into(),
        }
    }

    /// Classify `raw` and stamp it
    pub fn from_raw(raw: &RawOutcome) -> Self {
        Self::new(classify(raw), raw.detail())
    }
}
