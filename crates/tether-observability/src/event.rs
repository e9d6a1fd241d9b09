//! Event catalog
//!
//! Codes are stable: they are what dashboards and log queries key on, so a
//! code is never reused for a different event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Severity of a catalog event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Verbose,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &str {
        match self {
            Severity::Verbose => "verbose",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of one catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDescriptor {
    pub code: u16,
    pub name: &'static str,
    pub severity: Severity,
    pub template: &'static str,
}

impl EventDescriptor {
    /// Placeholder names appearing in the template, in order
    pub fn placeholders(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut rest = self.template;
        while let Some(start) = rest.find('{') {
            let after = &rest[start + 1..];
            match after.find('}') {
                Some(end) => {
                    names.push(&after[..end]);
                    rest = &after[end + 1..];
                }
                None => break,
            }
        }
        names
    }

    /// Substitute `{name}` placeholders; unknown ones are left verbatim
    pub fn render(&self, fields: &BTreeMap<String, String>) -> String {
        let mut out = String::with_capacity(self.template.len() + 32);
        let mut rest = self.template;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match fields.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

macro_rules! catalog {
    ($($variant:ident = $code:literal, $severity:ident, $template:literal;)+) => {
        /// Every event Tether can emit
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum EventId {
            $($variant,)+
        }

        impl EventId {
            pub const ALL: &'static [EventId] = &[$(EventId::$variant,)+];

            pub fn descriptor(&self) -> EventDescriptor {
                match self {
                    $(EventId::$variant => EventDescriptor {
                        code: $code,
                        name: stringify!($variant),
                        severity: Severity::$severity,
                        template: $template,
                    },)+
                }
            }
        }
    };
}

catalog! {
    // Remote execution client / daemon discovery
    RemotingClientDiscovered = 1000, Info, "Found remote execution client at {path}";
    RemotingClientNotFound = 1001, Warning, "No remote execution client found under {searched}";
    RemotingDaemonDiscovered = 1002, Info, "Remote execution daemon for {client} is {status}";
    RemotingDiscoveryException = 1003, Warning, "Exception while discovering remote execution client: {exception}";

    // Install lifecycle
    RemotingInstallStarted = 1010, Info, "Installing remote execution client into {directory} (force: {force})";
    RemotingInstallCompleted = 1011, Info, "Installed remote execution client into {directory} in {durationMs}ms";
    RemotingInstallSkipped = 1012, Verbose, "Remote execution client already installed in {directory}";
    RemotingInstallFailed = 1013, Error, "Failed to install remote execution client into {directory}: {reason}";

    // Repo configuration
    RemotingRepoConfigOverride = 1020, Info, "Repo config override {key} = {value}";

    // Per-pip external execution progress
    PipRemotingStarted = 1030, Verbose, "[{pip}] Starting external execution of {executable}";
    PipRemotingCompleted = 1031, Verbose, "[{pip}] External execution finished with exit code {exitCode} in {durationMs}ms";
    PipRemotingFailed = 1032, Warning, "[{pip}] External execution failed: {error}";
    PipRemotingCancelled = 1033, Info, "[{pip}] External execution cancelled";

    // Orchestrator-side connection lifecycle
    WorkerConnecting = 2000, Verbose, "Connecting to worker {worker} at {endpoint}";
    WorkerConnected = 2001, Verbose, "Connected to worker {worker} at {endpoint}";
    WorkerAttached = 2002, Info, "Worker {worker} attached to session {session}";
    WorkerAttachRejected = 2003, Warning, "Worker {worker} rejected attach ({rejection}): {reason}";
    ConnectionFailure = 2004, Error, "Connection to worker {worker} failed ({kind}): {detail}";
    CallRetry = 2005, Verbose, "Call {call} to worker {worker} failed on attempt {attempt} ({kind}); retrying in {delayMs}ms";
    WorkerExited = 2006, Info, "Worker {worker} acknowledged exit";
    ConnectionClosed = 2007, Verbose, "Connection to worker {worker} closed";

    // Worker-side session handling
    WorkerServerListening = 2100, Info, "Worker listening on {address} for session {session}";
    AttachReceived = 2101, Info, "Attach from {peer}: {verdict}";
    ExitReceived = 2102, Info, "Exit received for session {session}";

    // VM command proxy
    VmRequestWritten = 3000, Verbose, "Wrote {command} request to {path}";
    VmResponseRead = 3001, Verbose, "Read {command} response from {path}";
}

impl EventId {
    pub fn code(&self) -> u16 {
        self.descriptor().code
    }

    pub fn name(&self) -> &'static str {
        self.descriptor().name
    }

    pub fn severity(&self) -> Severity {
        self.descriptor().severity
    }

    pub fn from_code(code: u16) -> Option<EventId> {
        EventId::ALL.iter().copied().find(|id| id.code() == code)
    }
}

/// A rendered event as handed to sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub code: u16,
    pub name: String,
    pub severity: Severity,
    pub message: String,
    pub fields: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(id: EventId, fields: BTreeMap<String, String>) -> Self {
        let descriptor = id.descriptor();
        Self {
            code: descriptor.code,
            name: descriptor.name.to_string(),
            severity: descriptor.severity,
            message: descriptor.render(&fields),
            fields,
            timestamp: Utc::now(),
        }
    }

    pub fn id(&self) -> Option<EventId> {
        EventId::from_code(self.code)
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}
