// ABOUTME: Installs the backend's Python dependencies with `uv sync` into a per-version venv.
// ABOUTME: Streams classified output, retries once (mirror by timezone), and tracks the phase.

use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::watch;

use super::context::BackendContext;
use super::error::BackendError;
use super::events::{self, InstallSource};
use super::output::{LineStreams, classify_line};
use super::types::{FailureKind, InstallOutcome, InstallPhase, LineLevel};

pub const BOTH_SYNCS_FAILED: &str = "Both default and mirror install failed";

pub struct InstallRunner {
    ctx: BackendContext,
    phase: watch::Sender<InstallPhase>,
}

impl InstallRunner {
    pub fn new(ctx: BackendContext) -> Self {
        let (phase, _) = watch::channel(InstallPhase::NotStarted);
        Self { ctx, phase }
    }

    pub fn phase(&self) -> InstallPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstallPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: InstallPhase) {
        log::debug!("[BackendInstall] Phase -> {:?}", phase);
        self.phase.send_replace(phase);
    }

    /// Bootstrap tools, sync dependencies, and mark the environment installed.
    ///
    /// Emits `install://start` and exactly one `install://complete`.
    pub async fn install_dependencies(&self) -> InstallOutcome {
        events::emit_install_start(self.ctx.sink.as_ref(), InstallSource::Pipeline);
        let outcome = self.run_phases().await;
        if !outcome.success {
            if let Err(e) = self.ctx.lock.clear_installing() {
                log::warn!("[BackendInstall] Failed to clear installing marker: {}", e);
            }
            self.set_phase(InstallPhase::Failed);
            log::error!("[BackendInstall] {}", outcome.message);
        }
        events::emit_install_complete(self.ctx.sink.as_ref(), &outcome);
        outcome
    }

    async fn run_phases(&self) -> InstallOutcome {
        let lock = &self.ctx.lock;
        if let Err(e) = lock.set_installing().and_then(|()| lock.clear_installed()) {
            return InstallOutcome::failed(
                FailureKind::Internal,
                format!("Failed to write install marker: {}", e),
            );
        }

        self.set_phase(InstallPhase::BootstrappingTools);
        if let Err(e) = self.ctx.tools().ensure_all().await {
            log::error!("[BackendInstall] Tool bootstrap failed ({}): {}", e.code(), e);
            let message = e.to_string();
            return InstallOutcome::failed(BackendError::from(e).kind(), message);
        }

        self.set_phase(InstallPhase::SyncingDefault);
        if !self.run_sync(&[]).await {
            let fallback = self.ctx.config.fallback_sync_args();
            log::warn!(
                "[BackendInstall] Default sync failed, retrying with {:?}",
                fallback
            );
            self.set_phase(InstallPhase::SyncingMirror);
            if !self.run_sync(&fallback).await {
                return InstallOutcome::failed(
                    FailureKind::DependencyInstallFailed,
                    BOTH_SYNCS_FAILED,
                );
            }
        }

        self.set_phase(InstallPhase::Finalizing);
        if let Err(e) = self.ctx.lock.mark_installed() {
            return InstallOutcome::failed(
                FailureKind::Internal,
                format!("Failed to write installed marker: {}", e),
            );
        }
        self.spawn_post_install();
        let removed = self.cleanup_stale_venvs();
        if removed > 0 {
            log::info!("[BackendInstall] Removed {} stale venv(s)", removed);
        }

        self.set_phase(InstallPhase::Done);
        log::info!("[BackendInstall] Dependencies installed");
        InstallOutcome::ok("Dependencies installed successfully")
    }

    fn uv_command(&self) -> Command {
        let mut cmd = Command::new(self.ctx.uv_binary());
        cmd.current_dir(&self.ctx.paths.backend_dir)
            .envs(self.ctx.uv_env())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(super::CREATE_NO_WINDOW);
        cmd
    }

    /// One `uv sync` attempt. Returns whether it exited successfully.
    async fn run_sync(&self, extra_args: &[String]) -> bool {
        let mut cmd = self.uv_command();
        cmd.arg("sync")
            .arg("--no-dev")
            .arg("--cache-dir")
            .arg(self.ctx.paths.uv_cache_dir())
            .args(extra_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("[BackendInstall] Failed to spawn uv sync: {}", e);
                return false;
            }
        };

        let mut streams = LineStreams::attach(&mut child);
        while let Some(line) = streams.next().await {
            let level = classify_line(&line.text);
            match level {
                LineLevel::Error => log::warn!("[BackendInstall] {}", line.text),
                LineLevel::Info => log::debug!("[BackendInstall] {}", line.text),
            }
            events::emit_install_log(self.ctx.sink.as_ref(), line.stream, level, &line.text);
        }

        match child.wait().await {
            Ok(status) => {
                log::info!("[BackendInstall] uv sync exited with {}", status);
                status.success()
            }
            Err(e) => {
                log::error!("[BackendInstall] Failed to wait for uv sync: {}", e);
                false
            }
        }
    }

    /// Run the configured post-install task in the background. Failures are
    /// only logged.
    fn spawn_post_install(&self) {
        let args = self.ctx.config.post_install_args.clone();
        if args.is_empty() {
            return;
        }
        let mut cmd = self.uv_command();
        cmd.args(&args).stdout(Stdio::null()).stderr(Stdio::piped());
        tokio::spawn(async move {
            match cmd.output().await {
                Ok(output) if output.status.success() => {
                    log::info!("[BackendInstall] Post-install `uv {}` done", args.join(" "));
                }
                Ok(output) => log::warn!(
                    "[BackendInstall] Post-install `uv {}` failed ({}): {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => log::warn!("[BackendInstall] Post-install could not start: {}", e),
            }
        });
    }

    /// Delete `venvs/backend-*` directories left by other app versions.
    pub fn cleanup_stale_venvs(&self) -> usize {
        let current = self.ctx.venv_dir();
        let entries = match std::fs::read_dir(self.ctx.paths.venvs_dir()) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_backend_venv = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with("backend-"));
            if !is_backend_venv || path == current || !path.is_dir() {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!(
                    "[BackendInstall] Failed to remove stale venv {}: {}",
                    path.display(),
                    e
                ),
            }
        }
        removed
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::config::BackendConfig;
    use crate::backend::context::testing::TestEnv;
    use crate::backend::events::names;
    use crate::backend::tools::Tool;

    fn with_tools(env: &TestEnv, uv_body: &str) {
        env.install_fake_tool(Tool::Uv, uv_body);
        env.install_fake_tool(Tool::Bun, "exit 0");
    }

    #[tokio::test]
    async fn default_sync_success_marks_installed() {
        let env = TestEnv::new();
        with_tools(&env, "echo 'Resolved 3 packages in 10ms'; exit 0");
        let runner = InstallRunner::new(env.ctx.clone());

        let outcome = runner.install_dependencies().await;

        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(runner.phase(), InstallPhase::Done);
        let status = env.ctx.lock.status();
        assert!(status.installed_exists && !status.is_installing);
        assert_eq!(env.sink.count(names::INSTALL_START), 1);
        assert_eq!(env.sink.count(names::INSTALL_COMPLETE), 1);
        let logs = env.sink.payloads(names::INSTALL_LOG);
        assert_eq!(logs[0]["data"], "Resolved 3 packages in 10ms");
        assert_eq!(logs[0]["level"], "info");
    }

    #[tokio::test]
    async fn mirror_fallback_used_in_target_timezone() {
        let env = TestEnv::with_config(BackendConfig {
            timezone: Some("Asia/Shanghai".to_string()),
            post_install_args: Vec::new(),
            ..BackendConfig::default()
        });
        with_tools(
            &env,
            r#"case "$*" in
  *--default-index*) echo 'Installed 3 packages'; exit 0 ;;
  *) echo 'error: connection reset' >&2; exit 1 ;;
esac"#,
        );
        let runner = InstallRunner::new(env.ctx.clone());
        let phases = runner.subscribe();

        let outcome = runner.install_dependencies().await;

        assert!(outcome.success, "{}", outcome.message);
        assert!(phases.has_changed().unwrap());
        let logs = env.sink.payloads(names::INSTALL_LOG);
        assert!(
            logs.iter()
                .any(|l| l["data"] == "error: connection reset" && l["level"] == "error"
                    && l["type"] == "stderr")
        );
        assert!(logs.iter().any(|l| l["data"] == "Installed 3 packages"));
        assert!(env.ctx.lock.status().installed_exists);
    }

    #[tokio::test]
    async fn fallback_outside_target_timezone_repeats_default_args() {
        let env = TestEnv::new();
        let args_log = env.dir.path().join("args.log");
        with_tools(
            &env,
            &format!("echo \"$*\" >> '{}'; exit 1", args_log.display()),
        );
        let runner = InstallRunner::new(env.ctx.clone());

        let outcome = runner.install_dependencies().await;

        assert!(!outcome.success);
        let invocations = std::fs::read_to_string(&args_log).unwrap();
        let lines: Vec<&str> = invocations.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], lines[1]);
        assert!(lines[0].starts_with("sync --no-dev --cache-dir"));
        assert!(!invocations.contains("--default-index"));
    }

    #[tokio::test]
    async fn both_syncs_failing_clears_installing() {
        let env = TestEnv::new();
        with_tools(&env, "echo 'Traceback (most recent call last):' >&2; exit 2");
        env.ctx.lock.mark_installed().unwrap();
        let runner = InstallRunner::new(env.ctx.clone());

        let outcome = runner.install_dependencies().await;

        assert!(!outcome.success);
        assert_eq!(outcome.message, BOTH_SYNCS_FAILED);
        assert_eq!(outcome.failure, Some(FailureKind::DependencyInstallFailed));
        assert_eq!(runner.phase(), InstallPhase::Failed);
        let status = env.ctx.lock.status();
        assert!(!status.is_installing);
        assert!(!status.installed_exists);
        let complete = &env.sink.payloads(names::INSTALL_COMPLETE)[0];
        assert_eq!(complete["success"], false);
    }

    #[tokio::test]
    async fn tool_installer_failure_is_surfaced() {
        let env = TestEnv::with_config(BackendConfig {
            uv_installer: Some("exit 7".to_string()),
            post_install_args: Vec::new(),
            ..BackendConfig::default()
        });
        let runner = InstallRunner::new(env.ctx.clone());

        let outcome = runner.install_dependencies().await;

        assert_eq!(outcome.failure, Some(FailureKind::ToolInstallFailed));
        assert!(!env.ctx.lock.status().is_installing);
    }

    #[tokio::test]
    async fn stale_venvs_are_removed_but_current_kept() {
        let env = TestEnv::new();
        let venvs = env.ctx.paths.venvs_dir();
        std::fs::create_dir_all(venvs.join("backend-0.9.0")).unwrap();
        std::fs::create_dir_all(env.ctx.venv_dir()).unwrap();
        std::fs::create_dir_all(venvs.join("unrelated")).unwrap();
        let runner = InstallRunner::new(env.ctx.clone());

        assert_eq!(runner.cleanup_stale_venvs(), 1);
        assert!(env.ctx.venv_dir().exists());
        assert!(venvs.join("unrelated").exists());
        assert!(!venvs.join("backend-0.9.0").exists());
    }
}
