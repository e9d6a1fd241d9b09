/*!
 * Remote execution and VM command files, exercised through the public API
 */

use std::time::Duration;
use tempfile::TempDir;
use tether::remoting::{self, ProcessInfo, RemotingError, INSTALL_MANIFEST};
use tether::vm::{
    ProcessState, ProcessStateInfo, RunRequest, RunResult, VmCommandProxy, VmError,
};
use tether::{check_outcomes, Orchestrator, PipResponse, TetherConfig, WorkerHost};
use tether_connect::{Endpoint, ProxySettings};
use tether_observability::{EventCapture, EventId};
use tether_proto::InvocationIdentity;

fn remoting_config(dir: &TempDir) -> TetherConfig {
    let mut config = TetherConfig::default();
    config.worker.listen = "127.0.0.1:0".to_string();
    config.remoting.enabled = true;
    config.remoting.install_dir = dir.path().join("remoting");
    config
        .remoting
        .repo_overrides
        .insert("TETHER_TEST_OVERRIDE".to_string(), "from-config".to_string());
    config
}

#[tokio::test]
async fn test_first_initialize_installs_then_reuses() {
    let dir = TempDir::new().unwrap();
    let config = remoting_config(&dir);

    let capture = EventCapture::new();
    let first = remoting::from_config(&config.remoting, capture.logger());
    first.initialize().await.unwrap();
    assert!(first.is_initialized());
    assert!(config.remoting.install_dir.join(INSTALL_MANIFEST).exists());
    assert_eq!(capture.count(EventId::RemotingInstallCompleted), 1);
    assert_eq!(capture.count(EventId::RemotingRepoConfigOverride), 1);

    let capture = EventCapture::new();
    let second = remoting::from_config(&config.remoting, capture.logger());
    second.initialize().await.unwrap();
    assert_eq!(capture.count(EventId::RemotingInstallStarted), 0);
    assert_eq!(capture.count(EventId::RemotingClientDiscovered), 1);
}

#[tokio::test]
async fn test_missing_client_path_fails_initialize() {
    let dir = TempDir::new().unwrap();
    let mut config = remoting_config(&dir);
    config.remoting.client_path = Some(dir.path().join("no-such-client"));

    let capture = EventCapture::new();
    let remote = remoting::from_config(&config.remoting, capture.logger());
    assert!(matches!(
        remote.initialize().await,
        Err(RemotingError::ClientNotFound(_))
    ));
    assert!(!remote.is_initialized());
    assert_eq!(capture.count(EventId::RemotingDiscoveryException), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_remotes_pips_when_enabled() {
    let dir = TempDir::new().unwrap();
    let config = remoting_config(&dir);
    let identity = InvocationIdentity::new("build-7", "linux");

    let host = WorkerHost::start(&config, identity.clone(), EventCapture::new().logger())
        .await
        .unwrap();
    assert!(host.remoting().is_initialized());

    let orch = Orchestrator::new(
        identity,
        ProxySettings::default().with_call_timeout(Duration::from_secs(10)),
        EventCapture::new().logger(),
    )
    .unwrap();
    orch.register("w1", Endpoint::from(host.local_addr()))
        .await
        .unwrap();
    check_outcomes(&orch.attach_all().await).unwrap();

    let process = ProcessInfo::new("pip-env", "/bin/sh")
        .with_args(["-c", "printf %s \"$TETHER_TEST_OVERRIDE\""])
        .with_working_directory(dir.path());
    let outcome = orch.execute_pip("w1", &process).await.unwrap();
    let response: PipResponse = outcome.response_as().unwrap().unwrap();
    assert!(response.remoted);
    assert!(response.result.success());
    assert_eq!(response.result.stdout, "from-config");
    assert!(response
        .predicted_inputs
        .contains(&std::path::PathBuf::from("/bin/sh")));

    check_outcomes(&orch.exit_all().await).unwrap();
    orch.shutdown().await;
    host.run_until_exit(Duration::from_secs(5)).await.unwrap();
}

#[test]
fn test_vm_run_exchange() {
    let dir = TempDir::new().unwrap();
    let request_path = dir.path().join("vm/cmd/run.request.json");
    let result_path = dir.path().join("vm/cmd/run.result.json");

    let capture = EventCapture::new();
    let orchestrator_side = VmCommandProxy::new(capture.logger());
    let vm_side = VmCommandProxy::default();

    orchestrator_side
        .write_run(&request_path, &RunRequest::new("/bin/true", "/tmp", ""))
        .unwrap();
    let request = vm_side.read_run_request(&request_path).unwrap();
    assert_eq!(request.absolute_path, "/bin/true");
    assert_eq!(request.arguments, "");

    let result = RunResult {
        process_state_info: ProcessStateInfo {
            process_state: ProcessState::Exited,
            exit_code: 0,
            last_error: String::new(),
            termination_reason: None,
            std_out_path: "/tmp/out".to_string(),
            std_err_path: "/tmp/err".to_string(),
        },
        std_out_path: "/tmp/out".to_string(),
        std_err_path: "/tmp/err".to_string(),
    };
    vm_side.write_run_result(&result_path, &result).unwrap();

    let read = orchestrator_side.read_run_result(&result_path).unwrap();
    assert_eq!(read, result);
    assert!(read.process_state_info.has_exited());
    assert_eq!(capture.count(EventId::VmRequestWritten), 1);
    assert_eq!(capture.count(EventId::VmResponseRead), 1);
}

#[test]
fn test_vm_result_missing_or_garbled() {
    let dir = TempDir::new().unwrap();
    let proxy = VmCommandProxy::default();

    let missing = dir.path().join("absent.json");
    assert!(matches!(
        proxy.read_run_result(&missing),
        Err(VmError::Io { .. })
    ));

    let garbled = dir.path().join("garbled.json");
    std::fs::write(&garbled, b"{ not json").unwrap();
    assert!(matches!(
        proxy.read_run_result(&garbled),
        Err(VmError::Malformed { .. })
    ));
}
