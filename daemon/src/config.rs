use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PACKAGE_MANAGER: &str = "apt";
pub const DEFAULT_STARTUP_DELAY_SECS: u64 = 2;
/// Twelve hours between availability checks.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 12 * 60 * 60;
pub const MIN_POLL_INTERVAL_SECS: u64 = 60;
/// `apt list` prints a single "Listing..." line before the package entries.
pub const DEFAULT_HEADER_LINES: usize = 1;
pub const DEFAULT_PRIVILEGE_HELPER: &str = "pkexec";
pub const DEFAULT_UPGRADE_PROGRAM: &str = "apt-get";

/// Root configuration structure. Deserialized from `config.toml` in the app data dir.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub upgrade: UpgradeConfig,
}

/// Settings for the availability monitor.
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Name (looked up on PATH) or path of the package manager used for the query.
    #[serde(default = "default_package_manager")]
    pub package_manager: String,
    /// Grace period before the first check after startup.
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,
    /// Time between checks. Clamped to at least [`MIN_POLL_INTERVAL_SECS`].
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Number of leading lines of query output that are never package entries.
    #[serde(default = "default_header_lines")]
    pub header_lines: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            package_manager: DEFAULT_PACKAGE_MANAGER.to_string(),
            startup_delay_secs: DEFAULT_STARTUP_DELAY_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            header_lines: DEFAULT_HEADER_LINES,
        }
    }
}

impl MonitorConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS))
    }
}

/// The privileged, non-interactive upgrade command: `<privilege_helper> <program> <args...>`.
#[derive(Debug, Deserialize, Clone)]
pub struct UpgradeConfig {
    #[serde(default = "default_privilege_helper")]
    pub privilege_helper: String,
    #[serde(default = "default_upgrade_program")]
    pub program: String,
    #[serde(default = "default_upgrade_args")]
    pub args: Vec<String>,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            privilege_helper: DEFAULT_PRIVILEGE_HELPER.to_string(),
            program: DEFAULT_UPGRADE_PROGRAM.to_string(),
            args: default_upgrade_args(),
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_package_manager() -> String {
    DEFAULT_PACKAGE_MANAGER.to_string()
}

fn default_startup_delay() -> u64 {
    DEFAULT_STARTUP_DELAY_SECS
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_header_lines() -> usize {
    DEFAULT_HEADER_LINES
}

fn default_privilege_helper() -> String {
    DEFAULT_PRIVILEGE_HELPER.to_string()
}

fn default_upgrade_program() -> String {
    DEFAULT_UPGRADE_PROGRAM.to_string()
}

fn default_upgrade_args() -> Vec<String> {
    vec!["upgrade".to_string(), "-y".to_string()]
}
