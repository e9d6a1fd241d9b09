//! Process handles shared by both remoting variants
//!
//! A [`RemoteProcessHandle`] is a future resolving to the process result.
//! Its cancellation token is a child of the caller's token, so cancelling the
//! originating call kills the process, and so does dropping the handle.

use super::error::RemotingError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tether_observability::{EventId, EventLogger};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One pip's process invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pip_id: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl ProcessInfo {
    pub fn new(pip_id: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        let working_directory = std::env::temp_dir();
        Self {
            pip_id: pip_id.into(),
            executable: executable.into(),
            arguments: Vec::new(),
            working_directory,
            environment: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

/// What a finished process reports back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProcessResult {
    pub pip_id: String,
    /// None when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl RemoteProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Running process; await it for the result
#[derive(Debug)]
pub struct RemoteProcessHandle {
    pip_id: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<RemoteProcessResult, RemotingError>>,
}

impl RemoteProcessHandle {
    pub fn pip_id(&self) -> &str {
        &self.pip_id
    }

    /// Kill the process; the handle then resolves to `Cancelled`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Future for RemoteProcessHandle {
    type Output = Result<RemoteProcessResult, RemotingError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(RemotingError::TaskFailed(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RemoteProcessHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How to launch a process
#[derive(Debug, Clone, Default)]
pub(crate) struct LaunchSpec {
    /// Run `executable` through this launcher instead of directly
    pub launcher: Option<PathBuf>,
    /// Extra environment applied before the pip's own
    pub environment: BTreeMap<String, String>,
}

/// Start `process` on a task of its own.
///
/// Spawn failures surface through the handle, not here.
pub(crate) fn spawn_process(
    process: ProcessInfo,
    launch: LaunchSpec,
    cancel: &CancellationToken,
    events: EventLogger,
) -> RemoteProcessHandle {
    let token = cancel.child_token();
    let pip_id = process.pip_id.clone();
    let task = tokio::spawn(run_process(process, launch, token.clone(), events));
    RemoteProcessHandle {
        pip_id,
        cancel: token,
        task,
    }
}

async fn run_process(
    process: ProcessInfo,
    launch: LaunchSpec,
    cancel: CancellationToken,
    events: EventLogger,
) -> Result<RemoteProcessResult, RemotingError> {
    let pip = process.pip_id.clone();
    let executable = process.executable.display().to_string();

    let mut command = match &launch.launcher {
        Some(launcher) => {
            let mut command = Command::new(launcher);
            command.arg(&process.executable);
            command
        }
        None => Command::new(&process.executable),
    };
    command
        .args(&process.arguments)
        .current_dir(&process.working_directory)
        .envs(&launch.environment)
        .envs(&process.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    events
        .event(EventId::PipRemotingStarted)
        .field("pip", &pip)
        .field("executable", &executable)
        .emit();

    let started = Instant::now();
    let child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = RemotingError::Spawn { executable, source };
            events
                .event(EventId::PipRemotingFailed)
                .field("pip", &pip)
                .field("error", &err)
                .emit();
            return Err(err);
        }
    };

    // Dropping the output future drops the child, which kills it
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Killing pip {}", pip);
            events
                .event(EventId::PipRemotingCancelled)
                .field("pip", &pip)
                .emit();
            return Err(RemotingError::Cancelled(pip));
        }
        output = child.wait_with_output() => output,
    };

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            events
                .event(EventId::PipRemotingFailed)
                .field("pip", &pip)
                .field("error", &e)
                .emit();
            return Err(RemotingError::Io(e));
        }
    };

    let duration = started.elapsed();
    let exit_code = output.status.code();
    events
        .event(EventId::PipRemotingCompleted)
        .field("pip", &pip)
        .field(
            "exitCode",
            exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
        )
        .field("durationMs", duration_ms(duration))
        .emit();

    Ok(RemoteProcessResult {
        pip_id: pip,
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration_ms: duration_ms(duration),
    })
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
