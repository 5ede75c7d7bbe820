// ABOUTME: Core library for the Agent Desktop application.
// ABOUTME: The backend orchestrator, plus the Tauri shell behind the `desktop` feature.

pub mod backend;

#[cfg(feature = "desktop")]
mod desktop;

#[cfg(feature = "desktop")]
pub use desktop::run;
