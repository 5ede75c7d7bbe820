// ABOUTME: Spawns the backend server under `uv run` and waits for it to report readiness.
// ABOUTME: Resolves exactly once as ready, port conflict, startup timeout, or early exit.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::context::BackendContext;
use super::detector::InstallationLogDetector;
use super::error::BackendError;
use super::output::LineStreams;
use super::types::OutputLine;

/// Printed by uvicorn once the socket is accepting connections.
pub const READY_MARKER: &str = "Uvicorn running on";

const CONFLICT_MARKERS: [&str; 3] = [
    "address already in use",
    "error while attempting to bind",
    "only one usage of each socket address",
];

/// How long to keep reading buffered output after the child has exited.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

fn is_port_conflict(text: &str) -> bool {
    let lower = text.to_lowercase();
    CONFLICT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// A running backend. Owned by the manager until handed to the reaper.
pub struct ProcessHandle {
    pub(crate) child: Child,
    pub(crate) pid: Option<u32>,
    pub(crate) port: u16,
    pub(crate) pump: Option<JoinHandle<()>>,
    pub(crate) started_at: Instant,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// False once the child has exited.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

pub fn read_pid_record(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0)
}

pub fn write_pid_record(path: &Path, pid: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, pid.to_string())
}

/// Pid of a backend that has been spawned but has not settled yet.
pub type SpawnSlot = Arc<Mutex<Option<u32>>>;

enum Startup {
    Ready,
    Failed(BackendError),
}

pub struct ProcessSupervisor {
    ctx: BackendContext,
    detector: Arc<Mutex<InstallationLogDetector>>,
    spawned: Option<SpawnSlot>,
}

impl ProcessSupervisor {
    pub fn new(ctx: BackendContext, detector: Arc<Mutex<InstallationLogDetector>>) -> Self {
        Self {
            ctx,
            detector,
            spawned: None,
        }
    }

    /// Publish the child's pid into `slot` while `start` is waiting on it.
    pub fn tracking(mut self, slot: SpawnSlot) -> Self {
        self.spawned = Some(slot);
        self
    }

    fn publish_spawned(&self, pid: Option<u32>) {
        if let Some(slot) = &self.spawned {
            if let Ok(mut current) = slot.lock() {
                *current = pid;
            }
        }
    }

    fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.ctx.config.startup_timeout_ms)
    }

    /// Spawn the backend on `port` and wait until it is ready.
    ///
    /// On any failure the child is killed before returning.
    pub async fn start(&self, port: u16) -> Result<ProcessHandle, BackendError> {
        let port_arg = port.to_string();
        let mut cmd = Command::new(self.ctx.uv_binary());
        cmd.args(["run", "uvicorn", "main:app", "--port", port_arg.as_str(), "--loop", "asyncio"])
            .current_dir(&self.ctx.paths.backend_dir)
            .envs(self.ctx.uv_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so teardown can signal uvicorn and its workers together.
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(super::CREATE_NO_WINDOW);

        log::info!("[BackendSupervisor] Starting backend on port {}", port);
        let mut child = cmd.spawn()?;
        let pid = child.id();
        if let Some(pid) = pid {
            log::info!("[BackendSupervisor] Backend spawned with pid {}", pid);
            if let Err(e) = write_pid_record(&self.ctx.paths.pid_file(), pid) {
                log::warn!("[BackendSupervisor] Failed to record pid: {}", e);
            }
        }
        self.publish_spawned(pid);

        let mut streams = LineStreams::attach(&mut child);
        let started_at = Instant::now();

        let startup = self.wait_for_ready(&mut child, &mut streams, port).await;
        self.publish_spawned(None);
        match startup {
            Startup::Ready => {
                log::info!(
                    "[BackendSupervisor] Backend ready on port {} after {}ms",
                    port,
                    started_at.elapsed().as_millis()
                );
                let pump = self.spawn_pump(streams);
                Ok(ProcessHandle {
                    child,
                    pid,
                    port,
                    pump: Some(pump),
                    started_at,
                })
            }
            Startup::Failed(err) => {
                log::error!("[BackendSupervisor] Backend failed to start: {}", err);
                streams.abort();
                self.kill_failed(&mut child, pid).await;
                Err(err)
            }
        }
    }

    async fn wait_for_ready(
        &self,
        child: &mut Child,
        streams: &mut LineStreams,
        port: u16,
    ) -> Startup {
        let timeout = self.startup_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                line = streams.next() => match line {
                    Some(line) => {
                        if let Some(outcome) = self.inspect(&line, port) {
                            return outcome;
                        }
                    }
                    // Both pipes closed: the child is exiting or has detached its output.
                    None => {
                        return tokio::select! {
                            status = child.wait() => {
                                Startup::Failed(BackendError::ExitedEarly {
                                    code: status.ok().and_then(|s| s.code()),
                                })
                            }
                            _ = &mut deadline => Startup::Failed(BackendError::StartupTimeout(timeout)),
                        };
                    }
                },
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    // Lines may still be buffered behind the exit notification.
                    let drained = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, async {
                        while let Some(line) = streams.next().await {
                            if let Some(outcome) = self.inspect(&line, port) {
                                return Some(outcome);
                            }
                        }
                        None
                    })
                    .await;
                    return match drained {
                        Ok(Some(Startup::Failed(err))) => Startup::Failed(err),
                        _ => Startup::Failed(BackendError::ExitedEarly { code }),
                    };
                }
                _ = &mut deadline => {
                    return Startup::Failed(BackendError::StartupTimeout(timeout));
                }
            }
        }
    }

    /// Log one startup line and decide whether it settles the startup.
    fn inspect(&self, line: &OutputLine, port: u16) -> Option<Startup> {
        log::info!("[Backend] {}", line.text);
        if let Ok(mut detector) = self.detector.lock() {
            detector.observe(line);
        }
        if line.text.contains(READY_MARKER) {
            return Some(Startup::Ready);
        }
        if is_port_conflict(&line.text) {
            return Some(Startup::Failed(BackendError::PortConflict(port)));
        }
        None
    }

    fn spawn_pump(&self, mut streams: LineStreams) -> JoinHandle<()> {
        let detector = Arc::clone(&self.detector);
        tokio::spawn(async move {
            while let Some(line) = streams.next().await {
                log::info!("[Backend] {}", line.text);
                if let Ok(mut detector) = detector.lock() {
                    detector.observe(&line);
                }
            }
            log::info!("[BackendSupervisor] Backend output closed");
        })
    }

    async fn kill_failed(&self, child: &mut Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            self.ctx.process_table.terminate_tree(pid, true).await;
        }
        if let Err(e) = child.kill().await {
            log::debug!("[BackendSupervisor] Kill after failed start: {}", e);
        }
        super::lock::remove_if_exists(&self.ctx.paths.pid_file()).ok();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::config::BackendConfig;
    use crate::backend::context::testing::TestEnv;
    use crate::backend::events::names;
    use crate::backend::tools::Tool;

    fn supervisor(env: &TestEnv) -> ProcessSupervisor {
        let detector = InstallationLogDetector::new(env.ctx.lock.clone(), env.sink.clone());
        ProcessSupervisor::new(env.ctx.clone(), Arc::new(Mutex::new(detector)))
    }

    #[test]
    fn conflict_markers_match_case_insensitively() {
        assert!(is_port_conflict(
            "ERROR:    [Errno 98] Address already in use"
        ));
        assert!(is_port_conflict(
            "[WinError 10048] Only one usage of each socket address is normally permitted"
        ));
        assert!(!is_port_conflict("INFO:     Started server process"));
    }

    #[tokio::test]
    async fn ready_marker_resolves_with_handle() {
        let env = TestEnv::new();
        env.install_fake_tool(
            Tool::Uv,
            r#"echo "INFO:     Uvicorn running on http://127.0.0.1:$5 (Press CTRL+C to quit)" >&2
exec sleep 30"#,
        );

        let mut handle = supervisor(&env).start(5123).await.unwrap();

        assert_eq!(handle.port(), 5123);
        assert!(handle.is_running());
        assert_eq!(read_pid_record(&env.ctx.paths.pid_file()), handle.pid());
        handle.child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn bind_error_is_port_conflict() {
        let env = TestEnv::new();
        env.install_fake_tool(
            Tool::Uv,
            r#"echo "ERROR:    [Errno 98] error while attempting to bind on address ('127.0.0.1', $5): address already in use" >&2
exec sleep 30"#,
        );

        let err = supervisor(&env).start(5124).await.err().unwrap();

        assert!(matches!(err, BackendError::PortConflict(5124)));
        assert!(!env.ctx.paths.pid_file().exists());
    }

    #[tokio::test]
    async fn conflict_printed_just_before_exit_is_still_a_conflict() {
        let env = TestEnv::new();
        env.install_fake_tool(Tool::Uv, "echo 'Address already in use' >&2; exit 1");

        let err = supervisor(&env).start(5125).await.err().unwrap();

        assert!(matches!(err, BackendError::PortConflict(5125)));
    }

    #[tokio::test]
    async fn exit_before_ready_reports_code() {
        let env = TestEnv::new();
        env.install_fake_tool(Tool::Uv, "echo 'ModuleNotFoundError: fastapi' >&2; exit 3");

        let err = supervisor(&env).start(5126).await.err().unwrap();

        assert!(matches!(err, BackendError::ExitedEarly { code: Some(3) }));
    }

    #[tokio::test]
    async fn silence_past_deadline_times_out() {
        let env = TestEnv::with_config(BackendConfig {
            startup_timeout_ms: 300,
            ..BackendConfig::default()
        });
        env.install_fake_tool(Tool::Uv, "exec sleep 30");

        let started = Instant::now();
        let err = supervisor(&env).start(5127).await.err().unwrap();

        assert!(matches!(err, BackendError::StartupTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn ready_after_deadline_does_not_resolve_again() {
        let env = TestEnv::with_config(BackendConfig {
            startup_timeout_ms: 300,
            ..BackendConfig::default()
        });
        env.install_fake_tool(
            Tool::Uv,
            "sleep 1; echo 'INFO:     Uvicorn running on http://127.0.0.1:5129' >&2; exec sleep 30",
        );

        let err = supervisor(&env).start(5129).await.err().unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(matches!(err, BackendError::StartupTimeout(_)));
        // The late line was never read, so nothing was reported for it.
        assert!(env.sink.names().is_empty());
        assert!(!env.ctx.paths.pid_file().exists());
    }

    #[tokio::test]
    async fn implicit_install_during_startup_is_reported() {
        let env = TestEnv::new();
        env.install_fake_tool(
            Tool::Uv,
            r#"echo 'Installed 2 packages in 3ms' >&2
echo 'INFO:     Uvicorn running on http://127.0.0.1:5128' >&2
exec sleep 30"#,
        );

        let mut handle = supervisor(&env).start(5128).await.unwrap();

        assert_eq!(env.sink.count(names::INSTALL_START), 1);
        assert_eq!(env.sink.payloads(names::INSTALL_COMPLETE)[0]["success"], true);
        assert!(env.ctx.lock.status().installed_exists);
        handle.child.kill().await.unwrap();
    }
}
