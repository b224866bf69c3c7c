/// Canonical file paths for upgrade-monitor data files.
///
/// Everything lives under `$XDG_CONFIG_HOME/upgrade-monitor/` unless
/// `UPGRADE_MONITOR_DIR` points somewhere else:
///   - config.toml      Written by the user, read (and watched) by the daemon.
///   - status.toml      Written by the daemon, read by the tray applet.
///   - upgrade.log      Live output of the current or last upgrade session.
///   - upgrade.request  Created by a client to ask the daemon for an upgrade.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "upgrade-monitor";
pub const DIR_ENV_VAR: &str = "UPGRADE_MONITOR_DIR";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";
pub const LOG_FILE_NAME: &str = "upgrade.log";
pub const REQUEST_FILE_NAME: &str = "upgrade.request";

/// Returns the application data directory.
pub fn app_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DIR_ENV_VAR).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .context("Could not determine the user config directory")
}

/// File locations inside one app data directory.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub dir: PathBuf,
    pub config: PathBuf,
    pub status: PathBuf,
    pub log: PathBuf,
    pub request: PathBuf,
}

impl AppPaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            config: dir.join(CONFIG_FILE_NAME),
            status: dir.join(STATUS_FILE_NAME),
            log: dir.join(LOG_FILE_NAME),
            request: dir.join(REQUEST_FILE_NAME),
        }
    }

    /// Uses `dir` when given, otherwise [`app_data_dir`].
    pub fn resolve_with(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => Ok(Self::new(dir)),
            None => Ok(Self::new(&app_data_dir()?)),
        }
    }
}
