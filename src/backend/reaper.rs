// ABOUTME: Tears the backend down: graceful signal, bounded wait, force kill, record cleanup.
// ABOUTME: Also sweeps orphans a crashed previous run left behind on its recorded port or pid.

use std::time::Duration;

use super::context::BackendContext;
use super::lock::remove_if_exists;
use super::port::{read_port_record, remove_port_record};
use super::process_table::kill_port_listeners;
use super::supervisor::{ProcessHandle, read_pid_record};

/// Command-line fragments that identify a process as our backend.
const BACKEND_SIGNATURES: [&str; 2] = ["uvicorn", "main:app"];

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    /// The child exited within the grace period.
    pub graceful: bool,
    /// The child had to be force-killed.
    pub forced: bool,
    /// Listeners killed on the recorded port afterwards.
    pub port_listeners_killed: usize,
}

pub struct ProcessReaper {
    ctx: BackendContext,
}

impl ProcessReaper {
    pub fn new(ctx: BackendContext) -> Self {
        Self { ctx }
    }

    fn grace_period(&self) -> Duration {
        Duration::from_millis(self.ctx.config.graceful_stop_timeout_ms)
    }

    /// Stop `handle` (if any) and clear every trace of it. Best-effort: no
    /// step's failure prevents the next.
    pub async fn reap(&self, handle: Option<ProcessHandle>) -> ReapReport {
        let mut report = ReapReport::default();
        if let Some(handle) = handle {
            self.stop_handle(handle, &mut report).await;
        }
        self.clear_traces(&mut report).await;
        report
    }

    /// Stop a backend that was spawned but never reported ready, so no
    /// handle exists yet. Only the pid is available to signal.
    pub async fn reap_starting(&self, pid: u32) -> ReapReport {
        let mut report = ReapReport::default();
        let table = &self.ctx.process_table;
        log::info!("[BackendReaper] Stopping backend pid {} before it became ready", pid);

        table.terminate_tree(pid, false).await;
        let deadline = tokio::time::Instant::now() + self.grace_period();
        while table.is_alive(pid).await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        if table.is_alive(pid).await {
            log::warn!("[BackendReaper] Starting backend {} ignored SIGTERM, killing", pid);
            table.terminate_tree(pid, true).await;
            report.forced = true;
        } else {
            report.graceful = true;
        }

        self.clear_traces(&mut report).await;
        report
    }

    async fn stop_handle(&self, mut handle: ProcessHandle, report: &mut ReapReport) {
        if let Some(pump) = handle.pump.take() {
            pump.abort();
        }
        let table = &self.ctx.process_table;
        log::info!(
            "[BackendReaper] Stopping backend (pid {:?}, port {})",
            handle.pid,
            handle.port
        );

        if let Some(pid) = handle.pid {
            table.terminate_tree(pid, false).await;
        }
        match tokio::time::timeout(self.grace_period(), handle.child.wait()).await {
            Ok(_) => {
                report.graceful = true;
                log::info!("[BackendReaper] Backend exited gracefully");
            }
            Err(_) => {
                log::warn!(
                    "[BackendReaper] Backend did not exit within {}ms, killing",
                    self.ctx.config.graceful_stop_timeout_ms
                );
                if let Some(pid) = handle.pid {
                    table.terminate_tree(pid, true).await;
                }
                if let Err(e) = handle.child.kill().await {
                    log::warn!("[BackendReaper] Failed to kill backend: {}", e);
                }
                report.forced = true;
            }
        }
    }

    /// Recorded-port listeners, then the port and pid records and any
    /// `installing` marker left by an interrupted startup sync.
    async fn clear_traces(&self, report: &mut ReapReport) {
        let port_file = self.ctx.paths.port_file();
        if let Some(port) = read_port_record(&port_file) {
            report.port_listeners_killed =
                kill_port_listeners(self.ctx.process_table.as_ref(), port).await;
        }
        remove_port_record(&port_file);
        if let Err(e) = remove_if_exists(&self.ctx.paths.pid_file()) {
            log::warn!("[BackendReaper] Failed to remove pid record: {}", e);
        }
        if let Err(e) = self.ctx.lock.clear_installing() {
            log::warn!("[BackendReaper] Failed to clear installing marker: {}", e);
        }
    }

    /// Kill whatever a previous run left on its recorded port, and its
    /// recorded pid when that still looks like our backend. Returns how many
    /// processes were signalled.
    pub async fn cleanup_orphans(&self) -> usize {
        let table = self.ctx.process_table.as_ref();
        let mut killed = 0;

        let port_file = self.ctx.paths.port_file();
        if let Some(port) = read_port_record(&port_file) {
            log::info!("[BackendReaper] Sweeping recorded port {}", port);
            killed += kill_port_listeners(table, port).await;
            remove_port_record(&port_file);
        }

        let pid_file = self.ctx.paths.pid_file();
        if let Some(pid) = read_pid_record(&pid_file) {
            if pid != std::process::id() && table.is_alive(pid).await {
                let is_backend = table
                    .command_line(pid)
                    .await
                    .is_some_and(|cmd| BACKEND_SIGNATURES.iter().any(|sig| cmd.contains(sig)));
                if is_backend {
                    log::info!("[BackendReaper] Killing orphaned backend pid {}", pid);
                    if table.terminate_tree(pid, true).await {
                        killed += 1;
                    }
                } else {
                    log::info!(
                        "[BackendReaper] Recorded pid {} is no longer our backend, leaving it",
                        pid
                    );
                }
            }
            if let Err(e) = remove_if_exists(&pid_file) {
                log::warn!("[BackendReaper] Failed to remove pid record: {}", e);
            }
        }

        killed
    }
}
