/*!
 * Configuration types for Tether
 *
 * Every field has a default, so an empty (or missing) file is a valid
 * configuration. Command-line flags are applied on top by the binary.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TetherError};
use tether_connect::{ConnectionSettings, ProxySettings};
use tether_proto::InvocationIdentity;
use tether_resilience::{BackoffStrategy, RetryPolicy};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub remoting: RemotingConfig,
}

/// Which build session this process belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Fixed session id; a fresh UUID v4 is generated when absent
    #[serde(default)]
    pub session_id: Option<String>,

    /// Free-form environment label (OS, toolchain, ...)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            environment: default_environment(),
        }
    }
}

impl SessionConfig {
    /// Identity for this process
    pub fn identity(&self) -> InvocationIdentity {
        match &self.session_id {
            Some(id) => InvocationIdentity::new(id.clone(), self.environment.clone()),
            None => InvocationIdentity::generate(self.environment.clone()),
        }
    }
}

/// Timeouts for orchestrator-side connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-attempt deadline for a call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Name announced in the connection handshake
    #[serde(default = "default_local_name")]
    pub local_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            local_name: default_local_name(),
        }
    }
}

impl ConnectionConfig {
    pub fn to_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            local_name: self.local_name.clone(),
        }
    }
}

/// Retry schedule for transient connection errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_backoff_strategy")]
    pub backoff: BackoffStrategy,

    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff: default_backoff_strategy(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            backoff: self.backoff,
            jitter_factor: self.jitter_factor,
        }
    }
}

/// Diagnostic logging
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Write JSON logs here instead of stdout
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Force debug level regardless of `level`
    #[serde(default)]
    pub verbose: bool,

    /// Also append catalog events as JSON Lines to this file
    #[serde(default)]
    pub events_file: Option<PathBuf>,
}

/// Worker-side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Remote execution offload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotingConfig {
    /// Disabled means pips always run locally
    #[serde(default)]
    pub enabled: bool,

    /// Where the remote execution client is installed
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Use this client binary instead of discovering one under `install_dir`
    #[serde(default)]
    pub client_path: Option<PathBuf>,

    /// Repo-level overrides passed to the client as environment variables
    #[serde(default)]
    pub repo_overrides: BTreeMap<String, String>,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            install_dir: default_install_dir(),
            client_path: None,
            repo_overrides: BTreeMap::new(),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    #[default]
    Info,

    Debug,

    /// Everything, including per-frame traffic
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_environment() -> String {
    "default".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_local_name() -> String {
    "tether-orchestrator".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_strategy() -> BackoffStrategy {
    BackoffStrategy::ExponentialWithJitter
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_listen() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_install_dir() -> PathBuf {
    PathBuf::from(".tether/remoting")
}

impl TetherConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|source| TetherError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path` when given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| TetherError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.connect_timeout_ms == 0 {
            return Err(TetherError::Config(
                "connection.connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.connection.call_timeout_ms == 0 {
            return Err(TetherError::Config(
                "connection.call_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.session.environment.is_empty() {
            return Err(TetherError::Config(
                "session.environment must not be empty".to_string(),
            ));
        }
        self.retry
            .to_policy()
            .validate()
            .map_err(|e| TetherError::Config(format!("retry: {}", e)))?;
        Ok(())
    }

    /// Settings handed to every WorkerProxy
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            connection: self.connection.to_settings(),
            retry: self.retry.to_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_match_retry_policy_defaults() {
        let config = TetherConfig::default();
        assert_eq!(config.retry.to_policy(), RetryPolicy::default());
        assert_eq!(config.connection.connect_timeout_ms, 5_000);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(!config.remoting.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"
[session]
environment = "ci-linux"

[retry]
max_attempts = 5
backoff = "fixed"

[remoting]
enabled = true

[remoting.repo_overrides]
CACHE_NAMESPACE = "main"
"#,
        )
        .unwrap();

        let config = TetherConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.session.environment, "ci-linux");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff, BackoffStrategy::Fixed);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert_eq!(config.connection.call_timeout_ms, 30_000);
        assert!(config.remoting.enabled);
        assert_eq!(
            config.remoting.repo_overrides.get("CACHE_NAMESPACE"),
            Some(&"main".to_string())
        );
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = TetherConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(TetherError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = TetherConfig::default();
        config.connection.call_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = TetherConfig::default();
        config.connection.connect_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_multiplier() {
        let mut config = TetherConfig::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_names_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[retry]\nmax_attempts = \"many\"\n").unwrap();

        match TetherConfig::from_file(file.path()) {
            Err(TetherError::ConfigParse { path, .. }) => assert_eq!(path, file.path()),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_save_and_reload() {
        let file = NamedTempFile::new().unwrap();
        let mut config = TetherConfig::default();
        config.session.session_id = Some("4f1c".to_string());
        config.worker.listen = "0.0.0.0:7500".to_string();

        config.to_file(file.path()).unwrap();
        let loaded = TetherConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_identity_uses_fixed_session_or_generates() {
        let fixed = SessionConfig {
            session_id: Some("4f1c".to_string()),
            environment: "env".to_string(),
        };
        assert_eq!(fixed.identity().session_id, "4f1c");

        let generated = SessionConfig::default();
        let a = generated.identity();
        let b = generated.identity();
        assert_ne!(a.session_id, b.session_id);
        assert!(uuid::Uuid::parse_str(&a.session_id).is_ok());
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Warn.to_tracing_level(), tracing::Level::WARN);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
