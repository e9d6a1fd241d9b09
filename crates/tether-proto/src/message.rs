//! Session messages and the frame envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::InvocationIdentity;

/// Version exchanged in the transport greeting
pub const PROTOCOL_VERSION: u32 = 1;

/// Well-known call names
pub mod calls {
    pub const ATTACH: &str = "Attach";
    pub const EXIT: &str = "Exit";
}

/// One frame on the wire.
///
/// Tagged by a `type` field so frames stay readable when captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame sent by the dialing side
    Hello { protocol_version: u32, peer: String },

    /// Answer to `Hello`; the transport is usable once received
    HelloAck { protocol_version: u32 },

    /// A named call; `id` is unique per channel
    Request { id: u64, call: String, body: Value },

    /// Answer to the request with the same `id`
    Response { id: u64, result: CallResult },

    /// Explicit close; no frames follow
    Close { reason: CloseReason },
}

/// Outcome of a call as reported by the peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallResult {
    Ok { value: Value },
    Err { error: RemoteError },
}

impl CallResult {
    pub fn ok<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(CallResult::Ok {
            value: serde_json::to_value(value)?,
        })
    }

    pub fn err(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        CallResult::Err {
            error: RemoteError {
                kind,
                message: message.into(),
            },
        }
    }
}

/// Application-level error returned by the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// No handler for the call name
    UnknownCall,
    /// Work call issued before a successful Attach (or after Exit)
    NotAttached,
    /// The request body did not match the call's schema
    InvalidPayload,
    /// The handler ran and failed
    HandlerFailed,
}

/// Why a peer closed the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CloseReason {
    /// Orderly teardown requested by the sender
    Goodbye,

    /// Identity check failed; `session_mismatch` distinguishes hard refusals
    IdentityMismatch {
        session_mismatch: bool,
        detail: String,
    },

    /// The peer is going away (e.g. worker process shutting down)
    Shutdown { detail: String },

    /// The peer received something it could not process
    Protocol { detail: String },
}

impl CloseReason {
    pub fn detail(&self) -> &str {
        match self {
            CloseReason::Goodbye => "goodbye",
            CloseReason::IdentityMismatch { detail, .. }
            | CloseReason::Shutdown { detail }
            | CloseReason::Protocol { detail } => detail,
        }
    }
}

/// Metadata attached to an Attach call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Name of the calling orchestrator
    pub sender: String,
    pub protocol_version: u32,
}

/// Session handshake request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachRequest {
    pub session_id: String,
    pub environment: String,
    pub call_metadata: CallMetadata,
}

impl AttachRequest {
    pub fn new(identity: &InvocationIdentity, sender: impl Into<String>) -> Self {
        Self {
            session_id: identity.session_id.clone(),
            environment: identity.environment.clone(),
            call_metadata: CallMetadata {
                sender: sender.into(),
                protocol_version: PROTOCOL_VERSION,
            },
        }
    }

    pub fn identity(&self) -> InvocationIdentity {
        InvocationIdentity::new(self.session_id.clone(), self.environment.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    None,
    Tolerable,
    Hard,
}

/// Session handshake response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachResponse {
    pub accepted: bool,
    pub rejection_kind: RejectionKind,
    pub reason_text: String,
}

impl AttachResponse {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            rejection_kind: RejectionKind::None,
            reason_text: String::new(),
        }
    }

    pub fn rejected(kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            rejection_kind: kind,
            reason_text: reason.into(),
        }
    }
}

/// Graceful termination signal; only carries session correlation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitAck {
    pub acknowledged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_is_tagged() {
        let frame = Envelope::Request {
            id: 7,
            call: calls::EXIT.to_string(),
            body: serde_json::json!({"session_id": "s-1"}),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"request\""));
        assert!(json.contains("\"call\":\"Exit\""));
    }

    #[test]
    fn test_close_reason_wire_shape() {
        let reason = CloseReason::IdentityMismatch {
            session_mismatch: true,
            detail: "session s-2 is not s-1".to_string(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "identity_mismatch");
        assert_eq!(json["session_mismatch"], true);
        assert_eq!(reason.detail(), "session s-2 is not s-1");
    }

    #[test]
    fn test_attach_request_carries_identity() {
        let identity = InvocationIdentity::new("s-1", "ci");
        let request = AttachRequest::new(&identity, "orchestrator");
        assert_eq!(request.identity(), identity);
        assert_eq!(request.call_metadata.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_rejection_kind_names() {
        let response = AttachResponse::rejected(RejectionKind::Tolerable, "env differs");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["rejection_kind"], "tolerable");
        assert_eq!(json["accepted"], false);
    }

    #[test]
    fn test_call_result_error_shape() {
        let result = CallResult::err(RemoteErrorKind::NotAttached, "attach first");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "err");
        assert_eq!(json["error"]["kind"], "not_attached");
    }
}
