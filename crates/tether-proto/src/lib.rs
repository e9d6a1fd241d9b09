//! Wire protocol shared by the Tether orchestrator and its workers.
//!
//! This crate defines everything both ends of a worker connection must agree on:
//!
//! - **InvocationIdentity**: the session + environment pair naming a build
//! - **Messages**: Attach/Exit payloads and the framed `Envelope`
//! - **Codec**: length-prefixed JSON frames over any async byte stream
//!
//! # Example
//!
//! ```
//! use tether_proto::{IdentityMatch, InvocationIdentity};
//!
//! let local = InvocationIdentity::new("4f1c", "ci-linux");
//! let remote = InvocationIdentity::new("4f1c", "ci-macos");
//!
//! assert_eq!(local.compare(&remote), IdentityMatch::TolerableMismatch);
//! ```

pub mod codec;
pub mod error;
pub mod identity;
pub mod message;

pub use codec::{read_frame, write_frame, MAX_FRAME_LEN};
pub use error::ProtoError;
pub use identity::{IdentityMatch, InvocationIdentity};
pub use message::{
    calls, AttachRequest, AttachResponse, CallMetadata, CallResult, CloseReason, Envelope,
    ExitAck, ExitRequest, RejectionKind, RemoteError, RemoteErrorKind, PROTOCOL_VERSION,
};
