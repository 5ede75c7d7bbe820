// ABOUTME: Tunables for the backend pipeline: ports, timeouts, mirror selection and installers.
// ABOUTME: Defaults, then `backend.json` in user data, then environment overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;

pub const PORT_ENV: &str = "AGENT_DESKTOP_BACKEND_PORT";
pub const STARTUP_TIMEOUT_ENV: &str = "AGENT_DESKTOP_STARTUP_TIMEOUT_MS";
pub const SERVER_URL_ENV: &str = "AGENT_DESKTOP_SERVER_URL";
pub const TIMEZONE_ENV: &str = "AGENT_DESKTOP_TIMEZONE";

const DEFAULT_PORT: u16 = 5001;
const DEFAULT_PORT_ATTEMPTS: u16 = 50;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;
const STARTUP_TIMEOUT_MIN_MS: u64 = 1_000;
const STARTUP_TIMEOUT_MAX_MS: u64 = 10 * 60 * 1000;
const DEFAULT_GRACEFUL_STOP_MS: u64 = 3_000;
const DEFAULT_SERVER_URL: &str = "https://api.agent-desktop.dev/api";
const DEFAULT_MIRROR_TIMEZONE: &str = "Asia/Shanghai";
const DEFAULT_MIRROR_INDEX: &str = "https://mirrors.aliyun.com/pypi/simple/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    /// First port tried for the backend listener.
    pub preferred_port: u16,
    /// How many consecutive ports the allocator may try.
    pub port_attempts: u16,
    pub startup_timeout_ms: u64,
    /// Grace period between the terminate and kill signals on teardown.
    pub graceful_stop_timeout_ms: u64,
    /// Upstream base URL handed to the backend as `SERVER_URL`.
    pub server_url: String,
    /// IANA zone that switches the fallback sync to the mirror registry.
    pub mirror_timezone: String,
    pub mirror_args: Vec<String>,
    /// Forces the detected timezone; `None` asks the OS.
    pub timezone: Option<String>,
    /// `uv` arguments run after a successful install. Empty disables it.
    pub post_install_args: Vec<String>,
    /// Shell command replacing the default uv installer.
    pub uv_installer: Option<String>,
    /// Shell command replacing the default bun installer.
    pub bun_installer: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            preferred_port: DEFAULT_PORT,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            graceful_stop_timeout_ms: DEFAULT_GRACEFUL_STOP_MS,
            server_url: DEFAULT_SERVER_URL.to_string(),
            mirror_timezone: DEFAULT_MIRROR_TIMEZONE.to_string(),
            mirror_args: vec![
                "--default-index".to_string(),
                DEFAULT_MIRROR_INDEX.to_string(),
            ],
            timezone: None,
            post_install_args: vec!["run".to_string(), "task".to_string(), "babel".to_string()],
            uv_installer: None,
            bun_installer: None,
        }
    }
}

impl BackendConfig {
    /// Load defaults, merge the optional settings file, then apply env overrides.
    pub fn load(settings_file: &Path) -> Self {
        let mut config = Self::from_settings_file(settings_file);
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config
    }

    fn from_settings_file(settings_file: &Path) -> Self {
        let content = match std::fs::read_to_string(settings_file) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => {
                log::info!(
                    "[BackendConfig] Loaded overrides from {}",
                    settings_file.display()
                );
                config
            }
            Err(e) => {
                log::warn!(
                    "[BackendConfig] Ignoring malformed {}: {}",
                    settings_file.display(),
                    e
                );
                Self::default()
            }
        }
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup(PORT_ENV).and_then(|v| v.trim().parse::<u16>().ok()) {
            if port > 0 {
                self.preferred_port = port;
            }
        }
        if let Some(raw) = lookup(STARTUP_TIMEOUT_ENV) {
            match parse_clamped_ms(&raw, STARTUP_TIMEOUT_MIN_MS, STARTUP_TIMEOUT_MAX_MS) {
                Some(ms) => self.startup_timeout_ms = ms,
                None => log::warn!(
                    "[BackendConfig] Invalid {}={:?}, keeping {}ms",
                    STARTUP_TIMEOUT_ENV,
                    raw,
                    self.startup_timeout_ms
                ),
            }
        }
        if let Some(url) = lookup(SERVER_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.server_url = url.trim().to_string();
        }
        if let Some(tz) = lookup(TIMEZONE_ENV).filter(|v| !v.trim().is_empty()) {
            self.timezone = Some(tz.trim().to_string());
        }
    }

    /// IANA name of the machine's timezone, honouring the configured override.
    pub fn detect_timezone(&self) -> Option<String> {
        if let Some(tz) = &self.timezone {
            return Some(tz.clone());
        }
        jiff::tz::TimeZone::system()
            .iana_name()
            .map(|name| name.to_string())
    }

    /// Extra `uv sync` arguments for the retry after a failed default sync.
    pub fn fallback_sync_args(&self) -> Vec<String> {
        match self.detect_timezone() {
            Some(tz) if tz == self.mirror_timezone => self.mirror_args.clone(),
            _ => Vec::new(),
        }
    }
}

fn parse_clamped_ms(raw: &str, min: u64, max: u64) -> Option<u64> {
    raw.trim().parse::<u64>().ok().map(|v| v.clamp(min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_backend_contract() {
        let config = BackendConfig::default();
        assert_eq!(config.preferred_port, 5001);
        assert_eq!(config.startup_timeout_ms, 30_000);
        assert_eq!(config.mirror_timezone, "Asia/Shanghai");
    }

    #[test]
    fn env_overrides_are_applied_and_clamped() {
        let mut config = BackendConfig::default();
        config.apply_env_overrides(lookup_from(&[
            (PORT_ENV, "6100"),
            (STARTUP_TIMEOUT_ENV, "5"),
            (TIMEZONE_ENV, " Europe/Berlin "),
        ]));
        assert_eq!(config.preferred_port, 6100);
        assert_eq!(config.startup_timeout_ms, STARTUP_TIMEOUT_MIN_MS);
        assert_eq!(config.timezone.as_deref(), Some("Europe/Berlin"));
    }

    #[test]
    fn invalid_env_values_keep_defaults() {
        let mut config = BackendConfig::default();
        config.apply_env_overrides(lookup_from(&[
            (PORT_ENV, "not-a-port"),
            (STARTUP_TIMEOUT_ENV, "soon"),
        ]));
        assert_eq!(config, BackendConfig::default());
    }

    #[test]
    fn settings_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("backend.json");
        std::fs::write(&file, r#"{"preferredPort": 7000, "postInstallArgs": []}"#).unwrap();

        let config = BackendConfig::from_settings_file(&file);
        assert_eq!(config.preferred_port, 7000);
        assert!(config.post_install_args.is_empty());
        assert_eq!(config.port_attempts, DEFAULT_PORT_ATTEMPTS);
    }

    #[test]
    fn malformed_settings_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("backend.json");
        std::fs::write(&file, "{ not json").unwrap();
        assert_eq!(BackendConfig::from_settings_file(&file), BackendConfig::default());
    }

    #[test]
    fn mirror_args_only_for_target_timezone() {
        let mut config = BackendConfig::default();
        config.timezone = Some("Asia/Shanghai".to_string());
        assert_eq!(config.fallback_sync_args(), config.mirror_args);

        config.timezone = Some("America/New_York".to_string());
        assert!(config.fallback_sync_args().is_empty());
    }
}
