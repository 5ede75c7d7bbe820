// ABOUTME: Shared data types for the backend pipeline: stage results, lock status, phases.
// ABOUTME: Serialized camelCase for the UI layer.

use serde::{Deserialize, Serialize};

/// Typed failure categories surfaced to the UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    ToolInstallFailed,
    DependencyInstallFailed,
    PortExhausted,
    StartupTimeout,
    PortConflict,
    ExitedEarly,
    Internal,
}

/// Uniform result threaded through every install stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl InstallOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            failure: None,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            failure: Some(kind),
        }
    }
}

/// Lock marker state, derived purely from file existence.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub is_installing: bool,
    pub has_any_lock: bool,
    pub installed_exists: bool,
}

impl LockStatus {
    /// An `installing` marker left behind, or no `installed` marker at all.
    pub fn is_incomplete(&self) -> bool {
        self.is_installing || !self.installed_exists
    }
}

/// Where the install runner currently is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum InstallPhase {
    NotStarted,
    BootstrappingTools,
    SyncingDefault,
    SyncingMirror,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineLevel {
    Info,
    Error,
}

/// One line of subprocess output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            text: text.into(),
        }
    }
}

/// Snapshot returned to the UI for polling.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub lock: LockStatus,
    pub phase: InstallPhase,
    pub running: bool,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
}
