//! VM command payloads
//!
//! Field names are PascalCase on disk; the VM-side runner reads them as-is.

use serde::{Deserialize, Serialize};

/// Sets up drive substitution inside the VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitializeVmRequest {
    pub subst_drive: String,
    pub subst_path: String,
}

/// Run one process inside the VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunRequest {
    pub absolute_path: String,
    pub working_directory: String,
    /// Command line after the executable, as a single string
    pub arguments: String,
}

impl RunRequest {
    pub fn new(
        absolute_path: impl Into<String>,
        working_directory: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            absolute_path: absolute_path.into(),
            working_directory: working_directory.into(),
            arguments: arguments.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunResult {
    pub process_state_info: ProcessStateInfo,
    pub std_out_path: String,
    pub std_err_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessStateInfo {
    pub process_state: ProcessState,
    pub exit_code: i32,
    pub last_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    pub std_out_path: String,
    pub std_err_path: String,
}

impl ProcessStateInfo {
    /// Process ran to completion (successfully or not)
    pub fn has_exited(&self) -> bool {
        self.process_state == ProcessState::Exited
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProcessState {
    #[default]
    Unknown,
    Starting,
    StartupError,
    Running,
    Exited,
    Crashed,
    TerminateError,
    Terminated,
    Terminating,
}

impl ProcessState {
    /// No further state changes will happen
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ProcessState::StartupError
                | ProcessState::Exited
                | ProcessState::Crashed
                | ProcessState::TerminateError
                | ProcessState::Terminated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminationReason {
    None,
    KilledByClient,
    ExceededMemoryQuota,
}
