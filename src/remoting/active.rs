//! Active remote execution over the local-process backend

use super::process::{spawn_process, LaunchSpec};
use super::{Installer, ProcessInfo, RemoteExecution, RemoteProcessHandle, RemotingError};
use crate::config::RemotingConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tether_observability::{EventId, EventLogger};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Marker written into the install directory by [`LocalInstaller`]
pub const INSTALL_MANIFEST: &str = "tether-remoting.json";

#[derive(Debug, Serialize, Deserialize)]
struct InstallManifest {
    version: String,
    installed_at: DateTime<Utc>,
}

/// Installs the client layout into a local directory
#[derive(Debug)]
pub struct LocalInstaller {
    directory: PathBuf,
    events: EventLogger,
}

impl LocalInstaller {
    pub fn new(directory: impl Into<PathBuf>, events: EventLogger) -> Self {
        Self {
            directory: directory.into(),
            events,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_installed(&self) -> bool {
        self.directory.join(INSTALL_MANIFEST).is_file()
    }

    async fn write_manifest(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let manifest = InstallManifest {
            version: env!("CARGO_PKG_VERSION").to_string(),
            installed_at: Utc::now(),
        };
        let contents = serde_json::to_vec_pretty(&manifest)?;
        tokio::fs::write(self.directory.join(INSTALL_MANIFEST), contents).await
    }
}

#[async_trait]
impl Installer for LocalInstaller {
    async fn install(&self, cancel: &CancellationToken, force_install: bool) -> bool {
        let directory = self.directory.display().to_string();
        if cancel.is_cancelled() {
            return false;
        }
        if !force_install && self.is_installed() {
            self.events
                .event(EventId::RemotingInstallSkipped)
                .field("directory", &directory)
                .emit();
            return true;
        }

        self.events
            .event(EventId::RemotingInstallStarted)
            .field("directory", &directory)
            .field("force", force_install)
            .emit();
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err("installation cancelled".to_string()),
            written = self.write_manifest() => written.map_err(|e| e.to_string()),
        };

        match result {
            Ok(()) => {
                self.events
                    .event(EventId::RemotingInstallCompleted)
                    .field("directory", &directory)
                    .field("durationMs", started.elapsed().as_millis())
                    .emit();
                true
            }
            Err(reason) => {
                self.events
                    .event(EventId::RemotingInstallFailed)
                    .field("directory", &directory)
                    .field("reason", reason)
                    .emit();
                false
            }
        }
    }
}

/// Remote execution backed by local child processes
#[derive(Debug)]
pub struct ActiveRemoteExecution {
    config: RemotingConfig,
    installer: LocalInstaller,
    events: EventLogger,
    initialized: AtomicBool,
    launcher: Mutex<Option<PathBuf>>,
    static_directories: Mutex<Vec<PathBuf>>,
}

impl ActiveRemoteExecution {
    pub fn new(config: RemotingConfig, events: EventLogger) -> Self {
        let installer = LocalInstaller::new(config.install_dir.clone(), events.clone());
        Self {
            config,
            installer,
            events,
            initialized: AtomicBool::new(false),
            launcher: Mutex::new(None),
            static_directories: Mutex::new(Vec::new()),
        }
    }

    pub fn static_directories(&self) -> Vec<PathBuf> {
        lock(&self.static_directories).clone()
    }

    /// Locate (or install) the client; returns the launcher to run pips through
    async fn discover_client(&self) -> Result<Option<PathBuf>, RemotingError> {
        if let Some(path) = &self.config.client_path {
            if !path.is_file() {
                self.events
                    .event(EventId::RemotingDiscoveryException)
                    .field(
                        "exception",
                        format!("configured client {} does not exist", path.display()),
                    )
                    .emit();
                return Err(RemotingError::ClientNotFound(path.clone()));
            }
            self.events
                .event(EventId::RemotingClientDiscovered)
                .field("path", path.display())
                .emit();
            return Ok(Some(path.clone()));
        }

        let directory = self.installer.directory().to_path_buf();
        if !self.installer.is_installed() {
            self.events
                .event(EventId::RemotingClientNotFound)
                .field("searched", directory.display())
                .emit();
            if !self.installer.install(&CancellationToken::new(), false).await {
                return Err(RemotingError::InstallFailed(format!(
                    "could not install into {}",
                    directory.display()
                )));
            }
        }
        self.events
            .event(EventId::RemotingClientDiscovered)
            .field("path", directory.display())
            .emit();
        Ok(None)
    }
}

#[async_trait]
impl RemoteExecution for ActiveRemoteExecution {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    async fn initialize(&self) -> Result<(), RemotingError> {
        if self.is_initialized() {
            return Ok(());
        }

        let launcher = self.discover_client().await?;
        let client = launcher
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "local-process backend".to_string());
        self.events
            .event(EventId::RemotingDaemonDiscovered)
            .field("client", &client)
            .field("status", "ready")
            .emit();

        for (key, value) in &self.config.repo_overrides {
            self.events
                .event(EventId::RemotingRepoConfigOverride)
                .field("key", key)
                .field("value", value)
                .emit();
        }

        *lock(&self.launcher) = launcher;
        self.initialized.store(true, Ordering::Release);
        info!("Remote execution initialized ({})", client);
        Ok(())
    }

    fn create_and_start(
        &self,
        process: ProcessInfo,
        cancel: &CancellationToken,
    ) -> Result<RemoteProcessHandle, RemotingError> {
        if !self.is_initialized() {
            return Err(RemotingError::NotInitialized);
        }
        let launch = LaunchSpec {
            launcher: lock(&self.launcher).clone(),
            environment: self.config.repo_overrides.clone(),
        };
        debug!("Starting pip {} ({})", process.pip_id, process.executable.display());
        Ok(spawn_process(process, launch, cancel, self.events.clone()))
    }

    /// Existing files named by the executable or the arguments.
    ///
    /// Files under a registered static directory are reported as that
    /// directory.
    fn input_prediction(&self, process: &ProcessInfo) -> Vec<PathBuf> {
        let static_dirs = self.static_directories();
        let resolve = |candidate: &str| {
            let path = Path::new(candidate);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                process.working_directory.join(path)
            }
        };

        let executable = process.executable.to_string_lossy();
        let candidates = std::iter::once(&*executable).chain(
            process
                .arguments
                .iter()
                .map(|arg| arg.split_once('=').map_or(arg.as_str(), |(_, value)| value)),
        );

        let mut predicted = BTreeSet::new();
        for candidate in candidates.filter(|c| !c.is_empty()) {
            let path = resolve(candidate);
            if !path.is_file() {
                continue;
            }
            match static_dirs.iter().find(|dir| path.starts_with(dir)) {
                Some(dir) => predicted.insert(dir.clone()),
                None => predicted.insert(path),
            };
        }
        predicted.into_iter().collect()
    }

    fn installer(&self) -> Option<&dyn Installer> {
        Some(&self.installer)
    }

    fn register_static_directories(&self, paths: Vec<PathBuf>) {
        let mut dirs = lock(&self.static_directories);
        for path in paths {
            if !dirs.contains(&path) {
                dirs.push(path);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
