// ABOUTME: Ensures the uv and bun binaries exist under the private bin directory.
// ABOUTME: Runs the official installer script with install-dir overrides when a binary is absent.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::Command;

use super::paths::BackendPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    /// Python package and environment manager.
    Uv,
    /// JS runtime used by the backend's frontend tasks.
    Bun,
}

impl Tool {
    pub const ALL: [Tool; 2] = [Tool::Uv, Tool::Bun];

    pub fn binary_name(self) -> &'static str {
        match (self, cfg!(windows)) {
            (Tool::Uv, false) => "uv",
            (Tool::Uv, true) => "uv.exe",
            (Tool::Bun, false) => "bun",
            (Tool::Bun, true) => "bun.exe",
        }
    }

    fn default_installer(self) -> &'static str {
        #[cfg(windows)]
        {
            match self {
                Tool::Uv => "irm https://astral.sh/uv/install.ps1 | iex",
                Tool::Bun => "irm bun.sh/install.ps1 | iex",
            }
        }
        #[cfg(not(windows))]
        {
            match self {
                Tool::Uv => "curl -LsSf https://astral.sh/uv/install.sh | sh",
                Tool::Bun => "curl -fsSL https://bun.sh/install | bash",
            }
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tool::Uv => write!(f, "uv"),
            Tool::Bun => write!(f, "bun"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolInstallError {
    #[error("{tool} installer failed: {message}")]
    ScriptFailed { tool: Tool, message: String },

    #[error("{tool} installer finished but {} is missing", path.display())]
    BinaryMissing { tool: Tool, path: PathBuf },
}

impl ToolInstallError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolInstallError::ScriptFailed { .. } => "SCRIPT_FAILED",
            ToolInstallError::BinaryMissing { .. } => "BINARY_MISSING",
        }
    }
}

/// Installs the toolchain the backend depends on.
#[derive(Debug, Clone)]
pub struct ToolBootstrapper {
    paths: BackendPaths,
    uv_installer: Option<String>,
    bun_installer: Option<String>,
}

impl ToolBootstrapper {
    pub fn new(
        paths: BackendPaths,
        uv_installer: Option<String>,
        bun_installer: Option<String>,
    ) -> Self {
        Self {
            paths,
            uv_installer,
            bun_installer,
        }
    }

    /// Return the tool's binary path, installing it first when missing.
    pub async fn ensure_tool(&self, tool: Tool) -> Result<PathBuf, ToolInstallError> {
        let binary = self.paths.tool_binary(tool);
        if binary.is_file() {
            log::debug!("[ToolBootstrapper] {} present at {}", tool, binary.display());
            return Ok(binary);
        }

        log::info!(
            "[ToolBootstrapper] {} not found at {}, running installer",
            tool,
            binary.display()
        );
        self.run_installer(tool).await?;

        if binary.is_file() {
            log::info!("[ToolBootstrapper] {} installed at {}", tool, binary.display());
            Ok(binary)
        } else {
            log::error!(
                "[ToolBootstrapper] {} installer succeeded but {} is missing",
                tool,
                binary.display()
            );
            Err(ToolInstallError::BinaryMissing { tool, path: binary })
        }
    }

    /// Ensure uv then bun. The first failure stops the sequence.
    pub async fn ensure_all(&self) -> Result<(), ToolInstallError> {
        for tool in Tool::ALL {
            self.ensure_tool(tool).await?;
        }
        Ok(())
    }

    fn installer_script(&self, tool: Tool) -> &str {
        let custom = match tool {
            Tool::Uv => self.uv_installer.as_deref(),
            Tool::Bun => self.bun_installer.as_deref(),
        };
        custom.unwrap_or_else(|| tool.default_installer())
    }

    async fn run_installer(&self, tool: Tool) -> Result<(), ToolInstallError> {
        let script = self.installer_script(tool);
        let bin_dir = self.paths.bin_dir();
        std::fs::create_dir_all(&bin_dir).map_err(|e| ToolInstallError::ScriptFailed {
            tool,
            message: format!("Failed to create {}: {}", bin_dir.display(), e),
        })?;

        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = Command::new("powershell");
            cmd.args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", script]);
            cmd.creation_flags(super::CREATE_NO_WINDOW);
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            cmd
        };

        // uv honours UV_INSTALL_DIR directly; bun appends `bin/` to BUN_INSTALL.
        cmd.env("UV_INSTALL_DIR", &bin_dir)
            .env("UV_NO_MODIFY_PATH", "1")
            .env("BUN_INSTALL", &self.paths.root)
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| ToolInstallError::ScriptFailed {
            tool,
            message: format!("Failed to execute installer: {}", e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolInstallError::ScriptFailed {
                tool,
                message: format!("exit status {}: {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}
