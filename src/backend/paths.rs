// ABOUTME: Filesystem layout for the backend runtime: tools, caches, venvs, records and markers.
// ABOUTME: All paths hang off a user-scoped root plus the app's user-data directory.

use std::path::{Path, PathBuf};

use super::tools::Tool;

/// Directory under the home directory that holds tools, caches and venvs.
pub const ROOT_DIR_NAME: &str = ".agent-desktop";
/// Overrides the user-scoped root (used by tests and portable installs).
pub const ROOT_ENV: &str = "AGENT_DESKTOP_HOME";

const VERSION_FILE: &str = "version.txt";
const PORT_FILE: &str = "port.txt";
const PID_FILE: &str = "backend.pid";
const SETTINGS_FILE: &str = "backend.json";

/// Resolved locations used by the install and process pipeline.
#[derive(Debug, Clone)]
pub struct BackendPaths {
    /// `~/.agent-desktop` or `$AGENT_DESKTOP_HOME`.
    pub root: PathBuf,
    /// The backend project (contains `pyproject.toml` and `main.py`).
    pub backend_dir: PathBuf,
    /// Per-app writable directory for version/port/pid records.
    pub user_data: PathBuf,
}

impl BackendPaths {
    pub fn new(root: PathBuf, backend_dir: PathBuf, user_data: PathBuf) -> Self {
        Self {
            root,
            backend_dir,
            user_data,
        }
    }

    /// Resolve the user-scoped root from the environment or the home directory.
    pub fn resolve(backend_dir: PathBuf, user_data: PathBuf) -> Result<Self, String> {
        let root = match std::env::var_os(ROOT_ENV) {
            Some(value) if !value.is_empty() && Path::new(&value).is_absolute() => {
                PathBuf::from(value)
            }
            _ => dirs::home_dir()
                .ok_or("Could not determine home directory")?
                .join(ROOT_DIR_NAME),
        };
        Ok(Self::new(root, backend_dir, user_data))
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    /// Expected location of a bootstrapped tool binary.
    pub fn tool_binary(&self, tool: Tool) -> PathBuf {
        self.bin_dir().join(tool.binary_name())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn uv_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("uv_cache")
    }

    pub fn uv_tool_dir(&self) -> PathBuf {
        self.cache_dir().join("uv_tool")
    }

    pub fn uv_python_dir(&self) -> PathBuf {
        self.cache_dir().join("uv_python")
    }

    pub fn venvs_dir(&self) -> PathBuf {
        self.root.join("venvs")
    }

    /// Isolated environment for one app version.
    pub fn venv_dir(&self, version: &str) -> PathBuf {
        self.venvs_dir().join(format!("backend-{}", version))
    }

    /// Directory holding the install lock markers.
    pub fn lock_root(&self) -> PathBuf {
        self.root.join("backend")
    }

    pub fn version_file(&self) -> PathBuf {
        self.user_data.join(VERSION_FILE)
    }

    pub fn port_file(&self) -> PathBuf {
        self.user_data.join(PORT_FILE)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.user_data.join(PID_FILE)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.user_data.join(SETTINGS_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_root_and_user_data() {
        let paths = BackendPaths::new(
            PathBuf::from("/home/u/.agent-desktop"),
            PathBuf::from("/opt/app/backend"),
            PathBuf::from("/home/u/.config/agent-desktop"),
        );

        assert_eq!(
            paths.uv_cache_dir(),
            PathBuf::from("/home/u/.agent-desktop/cache/uv_cache")
        );
        assert_eq!(
            paths.venv_dir("1.2.3"),
            PathBuf::from("/home/u/.agent-desktop/venvs/backend-1.2.3")
        );
        assert_eq!(
            paths.port_file(),
            PathBuf::from("/home/u/.config/agent-desktop/port.txt")
        );
        assert!(paths.tool_binary(Tool::Uv).starts_with(paths.bin_dir()));
    }
}
