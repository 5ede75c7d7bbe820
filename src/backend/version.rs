// ABOUTME: Decides whether the backend environment must be (re)installed for this app version.
// ABOUTME: Reads and writes the persisted version record and announces version updates.

use serde::Serialize;
use std::fs;
use std::future::Future;
use std::io;
use std::path::PathBuf;

use super::events::{EventSink, names};
use super::lock::LockCoordinator;
use super::types::{FailureKind, InstallOutcome};

/// Why an install is needed.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum UpdateReason {
    /// No version record on disk.
    Missing,
    /// Stored version differs from the running app.
    Mismatch,
    /// Caller asked for a reinstall.
    Forced,
    /// Version matches but the lock markers say the last install never finished.
    Incomplete,
}

#[derive(Debug, Clone)]
pub struct VersionGate {
    version_file: PathBuf,
}

impl VersionGate {
    pub fn new(version_file: PathBuf) -> Self {
        Self { version_file }
    }

    pub fn read(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.version_file) {
            Ok(content) => {
                let trimmed = content.trim();
                Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn write(&self, version: &str) -> io::Result<()> {
        if let Some(parent) = self.version_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.version_file, version)
    }

    /// Returns the reason an install is required, or `None` when the
    /// environment is current.
    pub fn evaluate(
        &self,
        previous: Option<&str>,
        current_version: &str,
        force_install: bool,
        lock: &LockCoordinator,
    ) -> Option<UpdateReason> {
        match previous {
            None => Some(UpdateReason::Missing),
            Some(_) if force_install => Some(UpdateReason::Forced),
            Some(stored) if stored != current_version => Some(UpdateReason::Mismatch),
            Some(_) if lock.status().is_incomplete() => Some(UpdateReason::Incomplete),
            Some(_) => None,
        }
    }

    /// Run `install` when the stored version is missing, stale, forced or
    /// incomplete, and persist `current_version` once it succeeds.
    ///
    /// A matching version with clean markers returns immediately without
    /// touching the filesystem.
    pub async fn check_and_install_if_needed<F, Fut>(
        &self,
        current_version: &str,
        force_install: bool,
        lock: &LockCoordinator,
        sink: &dyn EventSink,
        install: F,
    ) -> InstallOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = InstallOutcome>,
    {
        let previous = match self.read() {
            Ok(previous) => previous,
            Err(e) => {
                return InstallOutcome::failed(
                    FailureKind::Internal,
                    format!("Failed to read version record: {}", e),
                );
            }
        };

        let Some(reason) =
            self.evaluate(previous.as_deref(), current_version, force_install, lock)
        else {
            log::info!(
                "[VersionGate] Backend environment is current ({})",
                current_version
            );
            return InstallOutcome::ok("Dependencies already installed");
        };

        log::info!(
            "[VersionGate] Install required: previous={:?}, current={}, reason={:?}",
            previous,
            current_version,
            reason
        );
        sink.emit(
            names::VERSION_UPDATE,
            serde_json::json!({
                "type": "version-update",
                "previousVersion": previous,
                "currentVersion": current_version,
                "reason": reason,
            }),
        );

        let outcome = install().await;
        if !outcome.success {
            return outcome;
        }

        if let Err(e) = self.write(current_version) {
            log::error!("[VersionGate] Failed to persist version record: {}", e);
            return InstallOutcome::failed(
                FailureKind::Internal,
                format!("Installed, but failed to save version record: {}", e),
            );
        }
        outcome
    }
}
