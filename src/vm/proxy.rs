//! File-based request/response exchange with a VM-side runner
//!
//! The orchestrator writes a request file, the runner inside the VM picks
//! it up and writes the response next to it. Requests and responses are
//! plain JSON documents keyed only by their paths.

use super::messages::{InitializeVmRequest, RunRequest, RunResult};
use super::VmError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tether_observability::{EventId, EventLogger};

pub mod commands {
    pub const INITIALIZE: &str = "InitializeVm";
    pub const RUN: &str = "Run";
}

/// Reads and writes VM command files
#[derive(Debug, Clone, Default)]
pub struct VmCommandProxy {
    events: EventLogger,
}

impl VmCommandProxy {
    pub fn new(events: EventLogger) -> Self {
        Self { events }
    }

    pub fn write_initialize(&self, path: &Path, request: &InitializeVmRequest) -> Result<(), VmError> {
        self.write_request(path, commands::INITIALIZE, request)
    }

    pub fn write_run(&self, path: &Path, request: &RunRequest) -> Result<(), VmError> {
        self.write_request(path, commands::RUN, request)
    }

    pub fn read_run_request(&self, path: &Path) -> Result<RunRequest, VmError> {
        self.read_response(path, commands::RUN)
    }

    /// Used by the VM-side runner
    pub fn write_run_result(&self, path: &Path, result: &RunResult) -> Result<(), VmError> {
        self.write_request(path, commands::RUN, result)
    }

    pub fn read_run_result(&self, path: &Path) -> Result<RunResult, VmError> {
        self.read_response(path, commands::RUN)
    }

    /// Serialize `value` to `path`, creating the parent directory if absent
    pub fn write_request<T: Serialize>(
        &self,
        path: &Path,
        command: &str,
        value: &T,
    ) -> Result<(), VmError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| VmError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let contents = serde_json::to_vec_pretty(value)?;
        fs::write(path, contents).map_err(|source| VmError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        self.events
            .event(EventId::VmRequestWritten)
            .field("command", command)
            .field("path", path.display())
            .emit();
        Ok(())
    }

    pub fn read_response<T: DeserializeOwned>(&self, path: &Path, command: &str) -> Result<T, VmError> {
        let contents = fs::read(path).map_err(|source| VmError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value = serde_json::from_slice(&contents).map_err(|source| VmError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;

        self.events
            .event(EventId::VmResponseRead)
            .field("command", command)
            .field("path", path.display())
            .emit();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::messages::{ProcessState, ProcessStateInfo, TerminationReason};
    use tempfile::TempDir;
    use tether_observability::EventCapture;

    #[test]
    fn test_run_request_round_trip_creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("run.json");
        let capture = EventCapture::new();
        let proxy = VmCommandProxy::new(capture.logger());

        let request = RunRequest::new("/bin/true", "/tmp", "");
        proxy.write_run(&path, &request).unwrap();
        assert!(path.is_file());

        let read = proxy.read_run_request(&path).unwrap();
        assert_eq!(read, request);

        let written = capture.events_for(EventId::VmRequestWritten);
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].field("command"), Some("Run"));
        assert_eq!(capture.count(EventId::VmResponseRead), 1);
    }

    #[test]
    fn test_run_result_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("result.json");
        let proxy = VmCommandProxy::default();

        let result = RunResult {
            process_state_info: ProcessStateInfo {
                process_state: ProcessState::Terminated,
                exit_code: 137,
                last_error: "memory".to_string(),
                termination_reason: Some(TerminationReason::ExceededMemoryQuota),
                std_out_path: "/vm/out.txt".to_string(),
                std_err_path: "/vm/err.txt".to_string(),
            },
            std_out_path: "/vm/out.txt".to_string(),
            std_err_path: "/vm/err.txt".to_string(),
        };
        proxy.write_run_result(&path, &result).unwrap();
        assert_eq!(proxy.read_run_result(&path).unwrap(), result);
    }

    #[test]
    fn test_initialize_request_is_written() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("init.json");
        let proxy = VmCommandProxy::default();

        let request = InitializeVmRequest {
            subst_drive: "B:".to_string(),
            subst_path: "/builds".to_string(),
        };
        proxy.write_initialize(&path, &request).unwrap();
        let read: InitializeVmRequest = proxy.read_response(&path, commands::INITIALIZE).unwrap();
        assert_eq!(read, request);
    }

    #[test]
    fn test_missing_response_is_io_error() {
        let dir = TempDir::new().unwrap();
        let proxy = VmCommandProxy::default();
        let err = proxy.read_run_result(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, VmError::Io { .. }));
    }

    #[test]
    fn test_malformed_response_names_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{\"ProcessStateInfo\": 3}").unwrap();

        let proxy = VmCommandProxy::default();
        match proxy.read_run_result(&path) {
            Err(VmError::Malformed { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected malformed error, got {:?}", other),
        }
    }
}
