// ABOUTME: One-way notifications from the backend pipeline to the UI layer.
// ABOUTME: Event names, payload helpers, and the EventSink seam the desktop shell implements.

use serde_json::json;

use super::types::{FailureKind, InstallOutcome, LineLevel, StreamKind};

/// Event names emitted to the frontend
pub mod names {
    pub const INSTALL_START: &str = "install://start";
    pub const INSTALL_LOG: &str = "install://log";
    pub const INSTALL_COMPLETE: &str = "install://complete";
    pub const VERSION_UPDATE: &str = "backend://version-update";
    pub const RESTART_REQUESTED: &str = "backend://restart-requested";
    pub const RESTART_COMPLETED: &str = "backend://restart-completed";
    pub const READY: &str = "backend://ready";
    pub const FAILED: &str = "backend://failed";
}

/// Receiver of pipeline notifications. Delivery is best-effort and one-way.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: serde_json::Value);
}

/// Sink that only writes to the log; used when no UI is attached.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: &str, payload: serde_json::Value) {
        log::debug!("[Events] {} {}", event, payload);
    }
}

/// Where an install was started from.
#[derive(Debug, Clone, Copy)]
pub enum InstallSource {
    /// The pre-flight install pipeline.
    Pipeline,
    /// Detected in the backend's own output during `uv run`.
    BackendStartup,
}

impl InstallSource {
    fn as_str(self) -> &'static str {
        match self {
            InstallSource::Pipeline => "pipeline",
            InstallSource::BackendStartup => "backend",
        }
    }
}

pub fn emit_install_start(sink: &dyn EventSink, source: InstallSource) {
    sink.emit(names::INSTALL_START, json!({ "source": source.as_str() }));
}

pub fn emit_install_log(sink: &dyn EventSink, stream: StreamKind, level: LineLevel, data: &str) {
    sink.emit(
        names::INSTALL_LOG,
        json!({
            "type": stream,
            "level": level,
            "data": data,
        }),
    );
}

pub fn emit_install_complete(sink: &dyn EventSink, outcome: &InstallOutcome) {
    let payload = serde_json::to_value(outcome).unwrap_or_else(|_| {
        json!({ "success": outcome.success, "message": outcome.message })
    });
    sink.emit(names::INSTALL_COMPLETE, payload);
}

pub fn emit_ready(sink: &dyn EventSink, port: u16) {
    sink.emit(names::READY, json!({ "ready": true, "port": port }));
}

pub fn emit_failed(sink: &dyn EventSink, kind: FailureKind, message: &str) {
    sink.emit(names::FAILED, json!({ "kind": kind, "message": message }));
}

#[cfg(test)]
pub(crate) mod recording {
    use super::EventSink;
    use std::sync::Mutex;

    /// Captures every emitted event for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl RecordingSink {
        pub fn names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        }

        pub fn payloads(&self, event: &str) -> Vec<serde_json::Value> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == event)
                .map(|(_, payload)| payload.clone())
                .collect()
        }

        pub fn count(&self, event: &str) -> usize {
            self.payloads(event).len()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: &str, payload: serde_json::Value) {
            self.events
                .lock()
                .unwrap()
                .push((event.to_string(), payload));
        }
    }
}
