// ABOUTME: Error taxonomy for the backend pipeline.
// ABOUTME: Each variant maps onto a FailureKind the UI can render.

use std::time::Duration;
use thiserror::Error;

use super::tools::ToolInstallError;
use super::types::FailureKind;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Tool installation failed: {0}")]
    ToolInstallFailed(String),

    #[error("Dependency installation failed: {0}")]
    DependencyInstallFailed(String),

    #[error("No available port between {start} and {end}")]
    PortExhausted { start: u16, end: u32 },

    #[error("Backend did not become ready within {}s", .0.as_secs())]
    StartupTimeout(Duration),

    #[error("Port {0} is already in use by another process")]
    PortConflict(u16),

    #[error("Backend exited before becoming ready (exit code {code:?})")]
    ExitedEarly { code: Option<i32> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BackendError::ToolInstallFailed(_) => FailureKind::ToolInstallFailed,
            BackendError::DependencyInstallFailed(_) => FailureKind::DependencyInstallFailed,
            BackendError::PortExhausted { .. } => FailureKind::PortExhausted,
            BackendError::StartupTimeout(_) => FailureKind::StartupTimeout,
            BackendError::PortConflict(_) => FailureKind::PortConflict,
            BackendError::ExitedEarly { .. } => FailureKind::ExitedEarly,
            BackendError::Io(_) => FailureKind::Internal,
        }
    }
}

impl From<ToolInstallError> for BackendError {
    fn from(err: ToolInstallError) -> Self {
        BackendError::ToolInstallFailed(err.to_string())
    }
}
