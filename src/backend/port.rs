// ABOUTME: Chooses a free localhost TCP port for the backend, evicting stale listeners first.
// ABOUTME: Persists the choice so the next launch can clean up after a crash.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;

use super::error::BackendError;
use super::lock::remove_if_exists;
use super::process_table::{ProcessTable, kill_port_listeners};

const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Try to bind `127.0.0.1:port` and release it immediately.
pub async fn probe_bind(port: u16) -> io::Result<()> {
    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
    drop(socket);
    Ok(())
}

pub fn read_port_record(path: &Path) -> Option<u16> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse::<u16>().ok())
        .filter(|port| *port > 0)
}

pub fn write_port_record(path: &Path, port: u16) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, port.to_string())
}

pub fn remove_port_record(path: &Path) {
    if let Err(e) = remove_if_exists(path) {
        log::warn!("[PortAllocator] Failed to remove {}: {}", path.display(), e);
    }
}

pub struct PortAllocator {
    table: Arc<dyn ProcessTable>,
    port_file: PathBuf,
    settle_delay: Duration,
}

impl PortAllocator {
    pub fn new(table: Arc<dyn ProcessTable>, port_file: PathBuf) -> Self {
        Self {
            table,
            port_file,
            settle_delay: SETTLE_DELAY,
        }
    }

    #[cfg(test)]
    fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// First bindable port in `[start_port, start_port + max_attempts)`.
    ///
    /// A port from a previous run is cleared first. A busy candidate gets its
    /// listeners killed and is re-tested once before moving on.
    pub async fn find_available_port(
        &self,
        start_port: u16,
        max_attempts: u16,
    ) -> Result<u16, BackendError> {
        if let Some(recorded) = read_port_record(&self.port_file) {
            log::info!("[PortAllocator] Clearing listeners on recorded port {}", recorded);
            kill_port_listeners(self.table.as_ref(), recorded).await;
            remove_port_record(&self.port_file);
        }

        let end = start_port as u32 + max_attempts as u32;
        for candidate in start_port as u32..end.min(u16::MAX as u32 + 1) {
            let port = candidate as u16;
            match probe_bind(port).await {
                Ok(()) => {
                    log::info!("[PortAllocator] Using port {}", port);
                    return Ok(port);
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    let killed = kill_port_listeners(self.table.as_ref(), port).await;
                    if killed == 0 {
                        log::debug!("[PortAllocator] Port {} busy, no killable listener", port);
                        continue;
                    }
                    tokio::time::sleep(self.settle_delay).await;
                    if probe_bind(port).await.is_ok() {
                        log::info!("[PortAllocator] Reclaimed port {}", port);
                        return Ok(port);
                    }
                }
                Err(e) => {
                    log::debug!("[PortAllocator] Port {} unusable: {}", port, e);
                }
            }
        }

        Err(BackendError::PortExhausted {
            start: start_port,
            end,
        })
    }

    /// Find a port, sweeping the whole range once if the first pass fails,
    /// and record the result.
    pub async fn allocate(&self, preferred: u16, attempts: u16) -> Result<u16, BackendError> {
        let port = match self.find_available_port(preferred, attempts).await {
            Ok(port) => port,
            Err(first) => {
                log::warn!("[PortAllocator] {}; sweeping range and retrying", first);
                let end = (preferred as u32 + attempts as u32).min(u16::MAX as u32 + 1);
                for candidate in preferred as u32..end {
                    kill_port_listeners(self.table.as_ref(), candidate as u16).await;
                }
                tokio::time::sleep(self.settle_delay).await;
                self.find_available_port(preferred, attempts).await?
            }
        };

        if let Err(e) = write_port_record(&self.port_file, port) {
            log::warn!("[PortAllocator] Failed to record port {}: {}", port, e);
        }
        Ok(port)
    }
}
