// ABOUTME: Tauri shell: plugins, managed backend state, startup pipeline and exit teardown.
// ABOUTME: Forwards backend events to the webview and exposes status/restart commands.

use std::path::PathBuf;
use std::sync::Arc;
use tauri::{AppHandle, Emitter, Manager, RunEvent};
use tauri_plugin_log::{Target, TargetKind};

use crate::backend::{
    BackendConfig, BackendContext, BackendManager, BackendPaths, BackendStatus, EventSink,
    InstallOutcome, system_process_table,
};

/// Overrides where the Python backend project is read from (development checkouts).
const BACKEND_DIR_ENV: &str = "AGENT_DESKTOP_BACKEND_DIR";

type ManagerState = Arc<BackendManager>;

/// Emits pipeline events to every webview.
struct TauriEventSink(AppHandle);

impl EventSink for TauriEventSink {
    fn emit(&self, event: &str, payload: serde_json::Value) {
        if let Err(e) = self.0.emit(event, payload) {
            log::warn!("[Desktop] Failed to emit {}: {}", event, e);
        }
    }
}

fn resolve_backend_dir(app: &AppHandle) -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os(BACKEND_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    Ok(app.path().resource_dir()?.join("backend"))
}

fn build_manager(app: &AppHandle) -> anyhow::Result<BackendManager> {
    let user_data = app.path().app_data_dir()?;
    let backend_dir = resolve_backend_dir(app)?;
    let paths = BackendPaths::resolve(backend_dir, user_data).map_err(anyhow::Error::msg)?;
    let config = BackendConfig::load(&paths.settings_file());
    let version = app.package_info().version.to_string();

    log::info!(
        "[Desktop] Backend root {}, project {}, version {}",
        paths.root.display(),
        paths.backend_dir.display(),
        version
    );

    let ctx = BackendContext::new(
        paths,
        config,
        version,
        Arc::new(TauriEventSink(app.clone())),
        system_process_table(),
    );
    Ok(BackendManager::new(ctx))
}

#[tauri::command]
async fn get_backend_status(state: tauri::State<'_, ManagerState>) -> Result<BackendStatus, String> {
    Ok(state.install_status().await)
}

#[tauri::command]
async fn get_backend_port(state: tauri::State<'_, ManagerState>) -> Result<Option<u16>, String> {
    Ok(state.port().await)
}

#[tauri::command]
async fn restart_backend(state: tauri::State<'_, ManagerState>) -> Result<InstallOutcome, String> {
    let manager = state.inner().clone();
    Ok(manager.restart(false).await)
}

/// Restart with a forced dependency reinstall.
#[tauri::command]
async fn reinstall_backend(
    state: tauri::State<'_, ManagerState>,
) -> Result<InstallOutcome, String> {
    let manager = state.inner().clone();
    Ok(manager.restart(true).await)
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    #[allow(unused_mut)]
    let mut builder = tauri::Builder::default();

    // Must be registered first. The install markers are advisory, so a second
    // instance would race this one's install and backend process.
    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "windows"))]
    {
        builder = builder.plugin(tauri_plugin_single_instance::init(|app, _argv, _cwd| {
            log::info!("[Desktop] Second instance launched, focusing main window");
            if let Some(window) = app.get_webview_window("main") {
                let _ = window.unminimize();
                let _ = window.set_focus();
            }
        }));
    }

    builder
        .plugin(
            tauri_plugin_log::Builder::new()
                .targets([
                    Target::new(TargetKind::Stdout),
                    Target::new(TargetKind::LogDir { file_name: None }),
                    Target::new(TargetKind::Webview),
                ])
                .max_file_size(5_000_000) // 5 MB per log file
                .rotation_strategy(tauri_plugin_log::RotationStrategy::KeepOne)
                .level(if cfg!(debug_assertions) {
                    log::LevelFilter::Debug
                } else {
                    log::LevelFilter::Info
                })
                .build(),
        )
        .setup(|app| {
            let manager: ManagerState = Arc::new(build_manager(app.handle())?);
            app.manage(Arc::clone(&manager));

            tauri::async_runtime::spawn(async move {
                let outcome = manager.launch().await;
                if outcome.success {
                    log::info!("[Desktop] {}", outcome.message);
                } else {
                    log::error!("[Desktop] Backend startup failed: {}", outcome.message);
                }
            });
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            get_backend_status,
            get_backend_port,
            restart_backend,
            reinstall_backend,
        ])
        .build(tauri::generate_context!())
        .expect("error while building tauri application")
        .run(|app, event| {
            if let RunEvent::Exit = event {
                let Some(state) = app.try_state::<ManagerState>() else {
                    return;
                };
                let manager = state.inner().clone();
                let report = tauri::async_runtime::block_on(async move { manager.shutdown().await });
                log::info!("[Desktop] Backend teardown on exit: {:?}", report);
            }
        });
}
