//! Tether Connect: orchestrator-side worker connections
//!
//! This crate owns everything between "I want to call worker X" and bytes
//! on a socket:
//!
//! - **RpcChannel**: one multiplexed, length-prefixed TCP transport
//! - **Classifier**: maps raw outcomes onto four [`FailureKind`]s
//! - **CallDispatcher**: per-attempt deadlines, cancellation and retry
//! - **ConnectionManager**: the connection state machine and failure fan-out
//! - **WorkerProxy**: typed Attach / Exit / work calls for one worker
//!
//! # Example
//!
//! ```rust,no_run
//! use tether_connect::{Endpoint, ProxySettings, WorkerProxy};
//! use tether_observability::EventLogger;
//! use tether_proto::InvocationIdentity;
//!
//! # async fn example() -> Result<(), tether_connect::ConnectError> {
//! let proxy = WorkerProxy::new(
//!     "worker-1",
//!     "10.0.0.5:7400".parse::<Endpoint>()?,
//!     InvocationIdentity::generate("ci-linux"),
//!     ProxySettings::default(),
//!     EventLogger::tracing(),
//! )?;
//!
//! let attached = proxy.attach().await;
//! if attached.succeeded {
//!     let result = proxy.call("ExecutePip", serde_json::json!({"pip": 1})).await;
//!     println!("{}", result);
//!     proxy.exit().await;
//! }
//! proxy.close().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod classifier;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod manager;
pub mod outcome;
pub mod proxy;
pub mod state;

pub use channel::{ChannelEventSink, Endpoint, RpcChannel};
pub use classifier::{classify, FailureKind, FailureObservation, RawOutcome};
pub use dispatcher::{AttemptFailure, CallDispatcher, FailureReporter, ResponseCheck};
pub use error::ConnectError;
pub use listener::{ConnectionFailureEvent, ConnectionListener, FailureRecorder};
pub use manager::{ConnectionManager, ConnectionSettings};
pub use outcome::{CallFailure, CallOutcome, CallState};
pub use proxy::{ProxySettings, WorkerProxy};
pub use state::{ConnectionLifecycle, ConnectionState, StateTransition};
