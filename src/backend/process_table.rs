// ABOUTME: OS process capability: who listens on a port, and signalling a pid or its tree.
// ABOUTME: Unix uses lsof/fuser/ps and libc signals; Windows uses netstat, taskkill and wmic.

use async_trait::async_trait;
use std::sync::Arc;

/// Queries and signals processes outside our own child handles.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Pids with a TCP listener on `port`. Empty when none or unknown.
    async fn listening_pids(&self, port: u16) -> Vec<u32>;

    /// Signal one process. `force` means SIGKILL / `taskkill /F`.
    async fn terminate(&self, pid: u32, force: bool) -> bool;

    /// Signal a process and everything it spawned.
    async fn terminate_tree(&self, pid: u32, force: bool) -> bool;

    async fn is_alive(&self, pid: u32) -> bool;

    /// Full command line of a live process, when the OS exposes it.
    async fn command_line(&self, pid: u32) -> Option<String>;
}

/// The process table for the platform we were compiled for.
pub fn system_process_table() -> Arc<dyn ProcessTable> {
    #[cfg(unix)]
    {
        Arc::new(unix::UnixProcessTable)
    }
    #[cfg(windows)]
    {
        Arc::new(windows::WindowsProcessTable)
    }
}

/// Force-kill every listener on `port` except this process. Returns how many
/// pids were signalled.
pub async fn kill_port_listeners(table: &dyn ProcessTable, port: u16) -> usize {
    let own_pid = std::process::id();
    let mut killed = 0;
    for pid in table.listening_pids(port).await {
        if pid == own_pid {
            log::debug!("[ProcessTable] Skipping our own pid {} on port {}", pid, port);
            continue;
        }
        log::info!("[ProcessTable] Killing pid {} listening on port {}", pid, port);
        if table.terminate_tree(pid, true).await {
            killed += 1;
        }
    }
    killed
}

/// Parse whitespace-separated pids as printed by `lsof -t` or `fuser`.
pub(crate) fn parse_pid_lines(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .split_whitespace()
        .filter_map(|token| token.trim_end_matches(|c: char| !c.is_ascii_digit()).parse().ok())
        .filter(|pid| *pid > 0)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Extract listener pids for `port` from `netstat -ano` output.
pub(crate) fn parse_netstat_listeners(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            // Proto  Local  Foreign  State  PID
            if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("TCP") {
                return None;
            }
            if !cols[3].eq_ignore_ascii_case("LISTENING") || !cols[1].ends_with(&suffix) {
                return None;
            }
            cols[4].parse::<u32>().ok()
        })
        .filter(|pid| *pid > 0)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(unix)]
mod unix {
    use super::{ProcessTable, parse_pid_lines};
    use async_trait::async_trait;
    use tokio::process::Command;

    pub struct UnixProcessTable;

    fn send_signal(target: libc::pid_t, signal: libc::c_int) -> bool {
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe { libc::kill(target, signal) == 0 }
    }

    async fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
        let output = Command::new(program).args(args).output().await.ok()?;
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    #[async_trait]
    impl ProcessTable for UnixProcessTable {
        async fn listening_pids(&self, port: u16) -> Vec<u32> {
            let tcp = format!("-iTCP:{}", port);
            if let Some(out) = command_stdout("lsof", &["-nP", tcp.as_str(), "-sTCP:LISTEN", "-t"]).await {
                let pids = parse_pid_lines(&out);
                if !pids.is_empty() {
                    return pids;
                }
            }
            // fuser prints pids on stdout and the `port/tcp:` label on stderr.
            let spec = format!("{}/tcp", port);
            match command_stdout("fuser", &[spec.as_str()]).await {
                Some(out) => parse_pid_lines(&out),
                None => Vec::new(),
            }
        }

        async fn terminate(&self, pid: u32, force: bool) -> bool {
            let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
            send_signal(pid as libc::pid_t, signal)
        }

        async fn terminate_tree(&self, pid: u32, force: bool) -> bool {
            let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
            // Children spawned with their own process group die with the group;
            // anything else falls back to the single pid.
            send_signal(-(pid as libc::pid_t), signal) || send_signal(pid as libc::pid_t, signal)
        }

        async fn is_alive(&self, pid: u32) -> bool {
            if send_signal(pid as libc::pid_t, 0) {
                return true;
            }
            std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }

        async fn command_line(&self, pid: u32) -> Option<String> {
            let pid = pid.to_string();
            let out = command_stdout("ps", &["-o", "command=", "-p", pid.as_str()]).await?;
            let line = out.trim();
            (!line.is_empty()).then(|| line.to_string())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{ProcessTable, parse_netstat_listeners};
    use async_trait::async_trait;
    use tokio::process::Command;

    pub struct WindowsProcessTable;

    fn hidden(program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.creation_flags(crate::backend::CREATE_NO_WINDOW);
        cmd
    }

    async fn taskkill(pid: u32, tree: bool, force: bool) -> bool {
        let pid = pid.to_string();
        let mut args = vec!["/PID", pid.as_str()];
        if tree {
            args.push("/T");
        }
        if force {
            args.push("/F");
        }
        match hidden("taskkill").args(&args).output().await {
            Ok(output) => output.status.success(),
            Err(e) => {
                log::warn!("[ProcessTable] Failed to execute taskkill: {}", e);
                false
            }
        }
    }

    #[async_trait]
    impl ProcessTable for WindowsProcessTable {
        async fn listening_pids(&self, port: u16) -> Vec<u32> {
            match hidden("netstat").args(["-ano", "-p", "TCP"]).output().await {
                Ok(output) => {
                    parse_netstat_listeners(&String::from_utf8_lossy(&output.stdout), port)
                }
                Err(e) => {
                    log::warn!("[ProcessTable] Failed to execute netstat: {}", e);
                    Vec::new()
                }
            }
        }

        async fn terminate(&self, pid: u32, force: bool) -> bool {
            taskkill(pid, false, force).await
        }

        async fn terminate_tree(&self, pid: u32, force: bool) -> bool {
            taskkill(pid, true, force).await
        }

        async fn is_alive(&self, pid: u32) -> bool {
            let filter = format!("PID eq {}", pid);
            match hidden("tasklist")
                .args(["/FI", filter.as_str(), "/NH", "/FO", "CSV"])
                .output()
                .await
            {
                Ok(output) => String::from_utf8_lossy(&output.stdout)
                    .contains(&format!("\"{}\"", pid)),
                Err(_) => false,
            }
        }

        async fn command_line(&self, pid: u32) -> Option<String> {
            let filter = format!("ProcessId={}", pid);
            let output = hidden("wmic")
                .args(["process", "where", filter.as_str(), "get", "CommandLine", "/value"])
                .output()
                .await
                .ok()?;
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .find_map(|line| line.trim().strip_prefix("CommandLine="))
                .map(|cmd| cmd.trim().to_string())
                .filter(|cmd| !cmd.is_empty())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeProcessTable;
    use super::*;

    #[test]
    fn parses_lsof_and_fuser_output() {
        assert_eq!(parse_pid_lines("123\n456\n123\n"), vec![123, 456]);
        assert_eq!(parse_pid_lines("  4242  4243"), vec![4242, 4243]);
        // fuser may suffix access flags on some platforms.
        assert_eq!(parse_pid_lines("991e 17"), vec![17, 991]);
        assert!(parse_pid_lines("").is_empty());
    }

    #[test]
    fn parses_netstat_listeners_for_port_only() {
        let out = "\
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:5001           0.0.0.0:0              LISTENING       4321
  TCP    127.0.0.1:50010        0.0.0.0:0              LISTENING       999
  TCP    127.0.0.1:5001         127.0.0.1:60000        ESTABLISHED     555
  TCP    [::]:5001              [::]:0                 LISTENING       4321
";
        assert_eq!(parse_netstat_listeners(out, 5001), vec![4321]);
        assert_eq!(parse_netstat_listeners(out, 50010), vec![999]);
        assert!(parse_netstat_listeners(out, 8080).is_empty());
    }

    #[tokio::test]
    async fn kill_port_listeners_never_targets_self() {
        let table = FakeProcessTable::default();
        let own = std::process::id();
        table.add_listener(own, 5001, None);
        table.add_listener(own.wrapping_add(1), 5001, None);

        let killed = kill_port_listeners(&table, 5001).await;

        assert_eq!(killed, 1);
        assert_eq!(table.signalled(), vec![own.wrapping_add(1)]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_table_sees_and_terminates_real_child() {
        let table = system_process_table();
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        assert!(table.is_alive(pid).await);
        assert!(table.terminate(pid, false).await);
        child.wait().await.unwrap();
        assert!(!table.is_alive(pid).await);
    }
}
