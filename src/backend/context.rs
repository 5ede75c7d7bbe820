// ABOUTME: Shared state handed to every pipeline stage: paths, config, version, lock and sinks.
// ABOUTME: Also builds the environment every uv invocation runs with.

use std::path::PathBuf;
use std::sync::Arc;

use super::config::BackendConfig;
use super::events::EventSink;
use super::lock::LockCoordinator;
use super::paths::BackendPaths;
use super::process_table::ProcessTable;
use super::tools::{Tool, ToolBootstrapper};

#[derive(Clone)]
pub struct BackendContext {
    pub paths: BackendPaths,
    pub config: BackendConfig,
    pub app_version: String,
    pub lock: LockCoordinator,
    pub sink: Arc<dyn EventSink>,
    pub process_table: Arc<dyn ProcessTable>,
}

impl BackendContext {
    pub fn new(
        paths: BackendPaths,
        config: BackendConfig,
        app_version: impl Into<String>,
        sink: Arc<dyn EventSink>,
        process_table: Arc<dyn ProcessTable>,
    ) -> Self {
        let lock = LockCoordinator::new(paths.lock_root());
        Self {
            paths,
            config,
            app_version: app_version.into(),
            lock,
            sink,
            process_table,
        }
    }

    pub fn uv_binary(&self) -> PathBuf {
        self.paths.tool_binary(Tool::Uv)
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.paths.venv_dir(&self.app_version)
    }

    pub fn tools(&self) -> ToolBootstrapper {
        ToolBootstrapper::new(
            self.paths.clone(),
            self.config.uv_installer.clone(),
            self.config.bun_installer.clone(),
        )
    }

    /// Environment for `uv sync` and `uv run`, scoped to this app version.
    pub fn uv_env(&self) -> Vec<(String, String)> {
        let display = |p: PathBuf| p.to_string_lossy().into_owned();
        let current_path = std::env::var("PATH").unwrap_or_default();
        vec![
            ("UV_PROJECT_ENVIRONMENT".into(), display(self.venv_dir())),
            ("UV_CACHE_DIR".into(), display(self.paths.uv_cache_dir())),
            ("UV_TOOL_DIR".into(), display(self.paths.uv_tool_dir())),
            ("UV_PYTHON_INSTALL_DIR".into(), display(self.paths.uv_python_dir())),
            ("SERVER_URL".into(), self.config.server_url.clone()),
            ("PYTHONIOENCODING".into(), "utf-8".into()),
            ("PYTHONUNBUFFERED".into(), "1".into()),
            (
                "PATH".into(),
                prepend_path(&display(self.paths.bin_dir()), &current_path),
            ),
        ]
    }
}

fn path_separator() -> &'static str {
    if cfg!(windows) { ";" } else { ":" }
}

/// Put the private bin directory first and append the usual system bins,
/// since GUI launches on macOS and Linux start with a minimal PATH.
fn prepend_path(bin_dir: &str, current_path: &str) -> String {
    let separator = path_separator();
    let mut entries: Vec<String> = vec![bin_dir.to_string()];
    entries.extend(
        current_path
            .split(separator)
            .filter(|p| !p.is_empty() && *p != bin_dir)
            .map(|p| p.to_string()),
    );

    #[cfg(any(target_os = "macos", target_os = "linux"))]
    {
        #[cfg(target_os = "macos")]
        let common_bins: [&str; 4] = ["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin", "/bin"];
        #[cfg(target_os = "linux")]
        let common_bins: [&str; 3] = ["/usr/local/bin", "/usr/bin", "/bin"];

        for bin in common_bins {
            if !entries.iter().any(|e| e == bin) {
                entries.push(bin.to_string());
            }
        }
    }

    entries.join(separator)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backend::events::recording::RecordingSink;
    use crate::backend::process_table::fake::FakeProcessTable;

    /// A context rooted in a temp dir with recording sink and fake process table.
    pub struct TestEnv {
        pub dir: tempfile::TempDir,
        pub sink: Arc<RecordingSink>,
        pub table: Arc<FakeProcessTable>,
        pub ctx: BackendContext,
    }

    impl TestEnv {
        pub fn new() -> Self {
            Self::with_config(BackendConfig {
                timezone: Some("Europe/London".to_string()),
                post_install_args: Vec::new(),
                ..BackendConfig::default()
            })
        }

        pub fn with_config(config: BackendConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let paths = BackendPaths::new(
                dir.path().join("root"),
                dir.path().join("backend"),
                dir.path().join("user"),
            );
            std::fs::create_dir_all(&paths.backend_dir).unwrap();
            std::fs::create_dir_all(&paths.user_data).unwrap();
            let sink = Arc::new(RecordingSink::default());
            let table = Arc::new(FakeProcessTable::default());
            let ctx = BackendContext::new(paths, config, "1.0.0", sink.clone(), table.clone());
            Self {
                dir,
                sink,
                table,
                ctx,
            }
        }

        /// Install an executable script at the private bin location of `tool`.
        #[cfg(unix)]
        pub fn install_fake_tool(&self, tool: Tool, body: &str) -> PathBuf {
            let path = self.ctx.paths.tool_binary(tool);
            write_script(&path, body);
            path
        }
    }

    #[cfg(unix)]
    pub fn write_script(path: &std::path::Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestEnv;
    use super::*;

    #[test]
    fn uv_env_is_scoped_to_app_version() {
        let env = TestEnv::new();
        let vars: std::collections::HashMap<_, _> = env.ctx.uv_env().into_iter().collect();

        assert!(vars["UV_PROJECT_ENVIRONMENT"].ends_with("backend-1.0.0"));
        assert_eq!(vars["PYTHONUNBUFFERED"], "1");
        assert_eq!(vars["PYTHONIOENCODING"], "utf-8");
        let bin = env.ctx.paths.bin_dir().to_string_lossy().into_owned();
        assert!(vars["PATH"].starts_with(&bin));
    }

    #[test]
    fn prepend_path_dedupes_bin_dir() {
        let sep = path_separator();
        let current = ["/x/bin", "/usr/bin"].join(sep);
        let joined = prepend_path("/x/bin", &current);
        assert_eq!(joined.matches("/x/bin").count(), 1);
        assert!(joined.starts_with("/x/bin"));
    }
}
