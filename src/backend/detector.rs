// ABOUTME: Recognises dependency installs that `uv run` performs implicitly while starting the backend.
// ABOUTME: Mirrors them onto the install markers and install:// events.

use regex::Regex;
use std::sync::{Arc, LazyLock};

use super::events::{self, EventSink, InstallSource};
use super::lock::LockCoordinator;
use super::output::classify_line;
use super::supervisor::READY_MARKER;
use super::types::{FailureKind, InstallOutcome, OutputLine};

/// Line shapes uv prints while syncing. Anchored at the start of the line so
/// application logs (`INFO:     Updated 3 records`) never match.
static PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^\s*(?:×\s+)?(?:
            (?:Resolved|Prepared|Installed|Uninstalled|Audited)\s+\d+\s+packages?\b
          | (?:Downloading|Downloaded|Building|Built)\s+\S
          | Resolving\s+dependencies
          | Creating\s+virtual\s+environment
          | Updat(?:ing|ed)\s+(?:git\+)?https?://
          | [Nn]o\s+solution\s+found
        )",
    )
    .expect("progress regex")
});

static FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(failed to resolve dependencies|installation failed|no solution found)")
        .expect("failure regex")
});

/// What a single observed line meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorEvent {
    /// Unrelated output.
    Ignored,
    /// First install line seen; `install://start` was emitted.
    Started,
    /// Another line of an ongoing install.
    Progress,
    /// Ready marker after an install; the environment is now installed.
    Completed,
    /// The install reported a failure.
    Failed,
}

pub struct InstallationLogDetector {
    lock: LockCoordinator,
    sink: Arc<dyn EventSink>,
    install_detected: bool,
    notified_start: bool,
}

impl InstallationLogDetector {
    pub fn new(lock: LockCoordinator, sink: Arc<dyn EventSink>) -> Self {
        Self {
            lock,
            sink,
            install_detected: false,
            notified_start: false,
        }
    }

    pub fn install_detected(&self) -> bool {
        self.install_detected
    }

    pub fn reset(&mut self) {
        self.install_detected = false;
        self.notified_start = false;
    }

    pub fn observe(&mut self, line: &OutputLine) -> DetectorEvent {
        let text = line.text.as_str();
        let ready = text.contains(READY_MARKER);
        let mut started = false;

        if !self.install_detected {
            if ready || !PROGRESS.is_match(text) {
                return DetectorEvent::Ignored;
            }
            self.begin();
            started = true;
        }

        if ready {
            if let Err(e) = self.lock.mark_installed() {
                log::warn!("[InstallDetector] Failed to mark installed: {}", e);
            }
            log::info!("[InstallDetector] Startup install finished");
            events::emit_install_complete(
                self.sink.as_ref(),
                &InstallOutcome::ok("Dependencies installed during backend startup"),
            );
            self.reset();
            return DetectorEvent::Completed;
        }

        events::emit_install_log(self.sink.as_ref(), line.stream, classify_line(text), text);

        if FAILURE.is_match(text) {
            if let Err(e) = self.lock.clear_installing() {
                log::warn!("[InstallDetector] Failed to clear installing marker: {}", e);
            }
            log::error!("[InstallDetector] Startup install failed: {}", text);
            events::emit_install_complete(
                self.sink.as_ref(),
                &InstallOutcome::failed(FailureKind::DependencyInstallFailed, text),
            );
            self.reset();
            return DetectorEvent::Failed;
        }

        if started {
            DetectorEvent::Started
        } else {
            DetectorEvent::Progress
        }
    }

    fn begin(&mut self) {
        self.install_detected = true;
        log::info!("[InstallDetector] Backend is installing dependencies on startup");
        if let Err(e) = self.lock.set_installing() {
            log::warn!("[InstallDetector] Failed to set installing marker: {}", e);
        }
        if !self.notified_start {
            self.notified_start = true;
            events::emit_install_start(self.sink.as_ref(), InstallSource::BackendStartup);
        }
    }
}
