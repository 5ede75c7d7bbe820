// ABOUTME: Embedded Python backend: install orchestration and process lifecycle.
// ABOUTME: BackendManager is the entry point; the other modules are its stages.

pub mod config;
pub mod context;
pub mod detector;
pub mod error;
pub mod events;
pub mod install;
pub mod lock;
pub mod manager;
pub mod output;
pub mod paths;
pub mod port;
pub mod process_table;
pub mod reaper;
pub mod supervisor;
pub mod tools;
pub mod types;
pub mod version;

pub use config::BackendConfig;
pub use context::BackendContext;
pub use error::BackendError;
pub use events::{EventSink, LogEventSink};
pub use manager::BackendManager;
pub use paths::BackendPaths;
pub use process_table::{ProcessTable, system_process_table};
pub use types::{BackendStatus, FailureKind, InstallOutcome, InstallPhase, LockStatus};

/// Keeps helper processes from flashing a console window on Windows.
#[cfg(windows)]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x0800_0000;
