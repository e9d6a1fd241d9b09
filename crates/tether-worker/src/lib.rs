//! Tether worker: the remote end of a session.
//!
//! A [`WorkerServer`] is bound to one [`InvocationIdentity`]. It accepts the
//! orchestrator's Attach only when the session matches, serves work calls
//! while attached and resolves its completion signal when Exit arrives.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether_observability::EventLogger;
//! use tether_proto::InvocationIdentity;
//! use tether_worker::WorkerServer;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), tether_worker::WorkerError> {
//! let server = Arc::new(WorkerServer::new(
//!     InvocationIdentity::new("4f1c", "ci-linux"),
//!     EventLogger::tracing(),
//! ));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:7400").await?;
//! let shutdown = CancellationToken::new();
//!
//! let serving = tokio::spawn(server.clone().serve(listener, shutdown.clone()));
//! server.completion().await;
//! shutdown.cancel();
//! let _ = serving.await;
//! # Ok(())
//! # }
//! ```
//!
//! [`InvocationIdentity`]: tether_proto::InvocationIdentity

pub mod error;
pub mod lifecycle;
pub mod server;

pub use error::WorkerError;
pub use lifecycle::{WorkerLifecycle, WorkerState, WorkerTransition};
pub use server::{bind, AttachVerdict, UnsupportedHandler, WorkHandler, WorkerServer};
