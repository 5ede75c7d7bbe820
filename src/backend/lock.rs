// ABOUTME: Advisory install lock built from two sentinel files, `installing` and `installed`.
// ABOUTME: State lives only on disk so a freshly started process sees what a crashed one left.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::types::LockStatus;

pub const INSTALLING_MARKER: &str = "uv_installing.lock";
pub const INSTALLED_MARKER: &str = "uv_installed.lock";

/// Filesystem-marker mutex for dependency installs.
///
/// This is not an atomic test-and-set: two app instances launched at the same
/// moment can both observe "no marker" and install concurrently. The desktop
/// shell's single-instance plugin is what keeps that from happening.
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    root: PathBuf,
}

impl LockCoordinator {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn installing_path(&self) -> PathBuf {
        self.root.join(INSTALLING_MARKER)
    }

    pub fn installed_path(&self) -> PathBuf {
        self.root.join(INSTALLED_MARKER)
    }

    /// Write the `installing` marker. An existing `installed` marker stays, so
    /// a live re-sync on top of a usable environment does not invalidate it.
    pub fn set_installing(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.installing_path(), b"")
    }

    /// Forget that the environment is usable, ahead of replacing it.
    pub fn clear_installed(&self) -> io::Result<()> {
        remove_if_exists(&self.installed_path())
    }

    /// Remove the `installing` marker. Missing marker is not an error.
    pub fn clear_installing(&self) -> io::Result<()> {
        remove_if_exists(&self.installing_path())
    }

    /// Record a usable environment and drop the `installing` marker.
    pub fn mark_installed(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.installed_path(), b"")?;
        remove_if_exists(&self.installing_path())
    }

    pub fn status(&self) -> LockStatus {
        let is_installing = self.installing_path().exists();
        let installed_exists = self.installed_path().exists();
        LockStatus {
            is_installing,
            has_any_lock: is_installing || installed_exists,
            installed_exists,
        }
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> (tempfile::TempDir, LockCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockCoordinator::new(dir.path().join("backend"));
        (dir, lock)
    }

    #[test]
    fn set_installing_creates_root_and_is_idempotent() {
        let (_dir, lock) = coordinator();
        assert!(!lock.root().exists());

        lock.set_installing().unwrap();
        lock.set_installing().unwrap();

        let status = lock.status();
        assert!(status.is_installing);
        assert!(status.has_any_lock);
        assert!(!status.installed_exists);
        assert_eq!(std::fs::read(lock.installing_path()).unwrap(), b"");
    }

    #[test]
    fn clear_installing_always_leaves_not_installing() {
        let (_dir, lock) = coordinator();

        // Missing root and missing marker are both fine.
        lock.clear_installing().unwrap();
        assert!(!lock.status().is_installing);

        lock.set_installing().unwrap();
        lock.clear_installing().unwrap();
        lock.clear_installing().unwrap();
        assert!(!lock.status().is_installing);
    }

    #[test]
    fn mark_installed_clears_installing() {
        let (_dir, lock) = coordinator();
        lock.set_installing().unwrap();

        lock.mark_installed().unwrap();

        assert_eq!(
            lock.status(),
            LockStatus {
                is_installing: false,
                has_any_lock: true,
                installed_exists: true
            }
        );
    }

    #[test]
    fn set_installing_leaves_installed_until_cleared() {
        let (_dir, lock) = coordinator();
        lock.mark_installed().unwrap();

        lock.set_installing().unwrap();
        assert!(lock.status().installed_exists);

        lock.clear_installed().unwrap();
        lock.clear_installed().unwrap();
        let status = lock.status();
        assert!(status.is_installing && !status.installed_exists);
    }

    #[test]
    fn status_is_read_from_disk_by_any_instance() {
        let (_dir, lock) = coordinator();
        lock.set_installing().unwrap();

        // A second coordinator, as a freshly started process would build.
        let other = LockCoordinator::new(lock.root().to_path_buf());
        assert!(other.status().is_installing);
        assert!(other.status().is_incomplete());
    }
}
