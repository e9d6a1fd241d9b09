//! Call outcomes

use crate::classifier::FailureKind;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use tether_proto::RemoteError;

/// Terminal state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Succeeded,
    Failed,
    Cancelled,
}

impl CallState {
    pub fn as_str(&self) -> &str {
        match self {
            CallState::Succeeded => "succeeded",
            CallState::Failed => "failed",
            CallState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call did not succeed
#[derive(Debug, Clone, PartialEq)]
pub enum CallFailure {
    /// A classified connection failure
    Connection(FailureKind),
    /// The worker refused the attach but the connection stays usable
    SoftIdentityMismatch { reason: String },
    /// The worker ran the call and reported an error
    Remote(RemoteError),
    /// The caller's cancellation token fired
    Cancelled,
    /// The connection was already shut down when the attempt started
    ChannelShutdown,
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Connection(kind) => write!(f, "connection failure ({})", kind),
            CallFailure::SoftIdentityMismatch { reason } => {
                write!(f, "tolerable identity mismatch: {}", reason)
            }
            CallFailure::Remote(err) => write!(f, "remote error ({:?}): {}", err.kind, err.message),
            CallFailure::Cancelled => f.write_str("cancelled"),
            CallFailure::ChannelShutdown => f.write_str("channel shut down"),
        }
    }
}

/// Result record of one logical call.
///
/// `succeeded` is true iff `final_state` is [`CallState::Succeeded`];
/// `attempts` counts attempts actually started.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub call_name: String,
    pub attempts: u32,
    pub final_state: CallState,
    pub succeeded: bool,
    pub failure: Option<CallFailure>,
    pub response: Option<Value>,
}

impl CallOutcome {
    pub fn succeeded(call_name: &str, attempts: u32, response: Value) -> Self {
        Self {
            call_name: call_name.to_string(),
            attempts,
            final_state: CallState::Succeeded,
            succeeded: true,
            failure: None,
            response: Some(response),
        }
    }

    pub fn failed(call_name: &str, attempts: u32, failure: CallFailure) -> Self {
        Self::unsuccessful(call_name, attempts, CallState::Failed, failure)
    }

    pub fn cancelled(call_name: &str, attempts: u32, failure: CallFailure) -> Self {
        Self::unsuccessful(call_name, attempts, CallState::Cancelled, failure)
    }

    /// Outcome of a call refused before any attempt because the connection is shut down
    pub fn rejected(call_name: &str) -> Self {
        Self::cancelled(call_name, 0, CallFailure::ChannelShutdown)
    }

    fn unsuccessful(call_name: &str, attempts: u32, state: CallState, failure: CallFailure) -> Self {
        Self {
            call_name: call_name.to_string(),
            attempts,
            final_state: state,
            succeeded: false,
            failure: Some(failure),
            response: None,
        }
    }

    /// Classified connection failure, if that is why the call ended
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.failure {
            Some(CallFailure::Connection(kind)) => Some(kind),
            _ => None,
        }
    }

    /// Decode the response payload
    pub fn response_as<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.response
            .as_ref()
            .map(|value| serde_json::from_value(value.clone()))
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} after {} attempt(s)",
            self.call_name, self.final_state, self.attempts
        )?;
        if let Some(failure) = &self.failure {
            write!(f, ": {}", failure)?;
        }
        Ok(())
    }
}
