// ABOUTME: Top-level backend pipeline: version gate, install, port, start, restart and shutdown.
// ABOUTME: Serialises orchestration and turns every failure into an InstallOutcome plus events.

use anyhow::Context;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

use super::context::BackendContext;
use super::detector::InstallationLogDetector;
use super::error::BackendError;
use super::events::{self, names};
use super::install::InstallRunner;
use super::port::PortAllocator;
use super::reaper::{ProcessReaper, ReapReport};
use super::supervisor::{ProcessHandle, ProcessSupervisor, SpawnSlot};
use super::types::{BackendStatus, FailureKind, InstallOutcome};
use super::version::VersionGate;

pub struct BackendManager {
    ctx: BackendContext,
    gate: VersionGate,
    installer: InstallRunner,
    detector: Arc<Mutex<InstallationLogDetector>>,
    handle: AsyncMutex<Option<ProcessHandle>>,
    /// Pid of a backend still waiting for its ready line.
    spawning: SpawnSlot,
    /// Held for the whole of a launch or restart.
    pipeline: AsyncMutex<()>,
}

impl BackendManager {
    pub fn new(ctx: BackendContext) -> Self {
        let detector = InstallationLogDetector::new(ctx.lock.clone(), ctx.sink.clone());
        Self {
            gate: VersionGate::new(ctx.paths.version_file()),
            installer: InstallRunner::new(ctx.clone()),
            detector: Arc::new(Mutex::new(detector)),
            handle: AsyncMutex::new(None),
            spawning: SpawnSlot::default(),
            pipeline: AsyncMutex::new(()),
            ctx,
        }
    }

    pub fn context(&self) -> &BackendContext {
        &self.ctx
    }

    /// Install dependencies when the version record or lock markers call for it.
    pub async fn check_and_install_if_needed(&self, force_install: bool) -> InstallOutcome {
        self.gate
            .check_and_install_if_needed(
                &self.ctx.app_version,
                force_install,
                &self.ctx.lock,
                self.ctx.sink.as_ref(),
                || self.installer.install_dependencies(),
            )
            .await
    }

    /// Run the install pipeline unconditionally.
    pub async fn install_dependencies(&self) -> InstallOutcome {
        self.installer.install_dependencies().await
    }

    /// Allocate a port and start the backend, replacing any running instance.
    pub async fn start_backend(&self) -> Result<u16, BackendError> {
        let previous = self.handle.lock().await.take();
        if previous.is_some() {
            ProcessReaper::new(self.ctx.clone()).reap(previous).await;
        }

        let config = &self.ctx.config;
        let port = PortAllocator::new(self.ctx.process_table.clone(), self.ctx.paths.port_file())
            .allocate(config.preferred_port, config.port_attempts)
            .await?;
        let handle = ProcessSupervisor::new(self.ctx.clone(), Arc::clone(&self.detector))
            .tracking(Arc::clone(&self.spawning))
            .start(port)
            .await?;
        *self.handle.lock().await = Some(handle);
        Ok(port)
    }

    /// Full startup: orphan sweep, version gate, install, port, spawn.
    pub async fn launch(&self) -> InstallOutcome {
        let _guard = self.pipeline.lock().await;
        self.run_pipeline(false).await
    }

    /// Tear the backend down and run the full startup again.
    pub async fn restart(&self, force_install: bool) -> InstallOutcome {
        self.ctx.sink.emit(
            names::RESTART_REQUESTED,
            json!({ "forceInstall": force_install }),
        );
        let _guard = self.pipeline.lock().await;
        log::info!("[BackendManager] Restarting backend (force_install={})", force_install);

        self.shutdown().await;
        if let Ok(mut detector) = self.detector.lock() {
            detector.reset();
        }
        let outcome = self.run_pipeline(force_install).await;

        self.ctx.sink.emit(
            names::RESTART_COMPLETED,
            json!({ "success": outcome.success, "message": outcome.message }),
        );
        outcome
    }

    /// Stop the backend and clean up its records, including a backend that
    /// is still starting.
    pub async fn shutdown(&self) -> ReapReport {
        let handle = self.handle.lock().await.take();
        let reaper = ProcessReaper::new(self.ctx.clone());
        if handle.is_none() {
            let starting = self.spawning.lock().ok().and_then(|mut pid| pid.take());
            if let Some(pid) = starting {
                return reaper.reap_starting(pid).await;
            }
        }
        reaper.reap(handle).await
    }

    pub async fn install_status(&self) -> BackendStatus {
        let mut guard = self.handle.lock().await;
        let (running, port, pid, uptime_secs) = match guard.as_mut() {
            Some(handle) => (
                handle.is_running(),
                Some(handle.port()),
                handle.pid(),
                Some(handle.uptime().as_secs()),
            ),
            None => (false, None, None, None),
        };
        BackendStatus {
            lock: self.ctx.lock.status(),
            phase: self.installer.phase(),
            running,
            port,
            pid,
            uptime_secs,
        }
    }

    pub async fn port(&self) -> Option<u16> {
        self.handle.lock().await.as_ref().map(ProcessHandle::port)
    }

    async fn run_pipeline(&self, force_install: bool) -> InstallOutcome {
        match self.try_pipeline(force_install).await {
            Ok(port) => {
                events::emit_ready(self.ctx.sink.as_ref(), port);
                InstallOutcome::ok(format!("Backend running on port {}", port))
            }
            Err(err) => {
                let kind = err
                    .downcast_ref::<BackendError>()
                    .map(BackendError::kind)
                    .unwrap_or(FailureKind::Internal);
                let message = format!("{:#}", err);
                log::error!("[BackendManager] Backend pipeline failed: {}", message);
                events::emit_failed(self.ctx.sink.as_ref(), kind, &message);
                InstallOutcome::failed(kind, message)
            }
        }
    }

    async fn try_pipeline(&self, force_install: bool) -> anyhow::Result<u16> {
        std::fs::create_dir_all(&self.ctx.paths.user_data).with_context(|| {
            format!(
                "Failed to create user data directory {}",
                self.ctx.paths.user_data.display()
            )
        })?;

        let swept = ProcessReaper::new(self.ctx.clone()).cleanup_orphans().await;
        if swept > 0 {
            log::info!("[BackendManager] Cleaned up {} orphaned process(es)", swept);
        }

        let outcome = self.check_and_install_if_needed(force_install).await;
        if !outcome.success {
            return Err(match outcome.failure {
                Some(FailureKind::ToolInstallFailed) => {
                    BackendError::ToolInstallFailed(outcome.message).into()
                }
                Some(FailureKind::DependencyInstallFailed) => {
                    BackendError::DependencyInstallFailed(outcome.message).into()
                }
                _ => anyhow::anyhow!(outcome.message),
            });
        }

        Ok(self.start_backend().await?)
    }
}
