/*!
 * Tether - session layer between a build orchestrator and its workers
 *
 * - One connection per worker, validated by an invocation identity
 * - Attach / Exit control calls and named work calls with bounded retry
 * - Failure classification and at-most-once terminal notifications
 * - Remote execution offload and a file-based VM command proxy
 *
 * The connection machinery lives in the `tether-*` member crates; this
 * crate wires it to configuration, logging and the `tether` binary.
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod pip;
pub mod remoting;
pub mod vm;
pub mod worker_host;

// Re-export commonly used types
pub use config::{LogLevel, TetherConfig};
pub use error::{Result, TetherError};
pub use orchestrator::{check_outcomes, Orchestrator, SessionOutcomes};
pub use pip::{PipExecutor, PipResponse, EXECUTE_PIP};
pub use worker_host::WorkerHost;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
