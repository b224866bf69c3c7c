use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::event::DaemonEvent;
use crate::query::UpgradablePackage;
use crate::upgrade::{CANCELLED_MARKER, DONE_MARKER};

/// Current operational state of the daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// Waiting for the next poll or an upgrade request.
    Idle,
    /// An upgrade session is running; its output goes to `upgrade.log`.
    Upgrading,
}

/// Runtime status written by the daemon to `status.toml`.
/// A tray applet reads this file to decide whether to show the update indicator.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: DaemonState,
    /// True when the last successful check found at least one upgradable package.
    pub indicator_visible: bool,
    /// Raw lines of the last successful check, one per package.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upgradable_packages: Vec<String>,
    /// RFC 3339 timestamp of the last successful check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<String>,
    /// Exit code of the most recent upgrade session, if it exited normally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_upgrade_exit_code: Option<i32>,
    /// Human-readable error message if the daemon encountered a non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonStatus {
    /// Constructs the initial idle status on daemon startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: DaemonState::Idle,
            indicator_visible: false,
            upgradable_packages: Vec::new(),
            last_check: None,
            last_upgrade_exit_code: None,
            error: None,
        }
    }

    /// Records a successful check, showing the indicator when `packages` is non-empty.
    pub fn record_check(&mut self, packages: &[UpgradablePackage]) {
        if packages.is_empty() {
            self.hide_indicator();
        } else {
            self.show_indicator(packages);
        }
        self.last_check = Some(chrono::Local::now().to_rfc3339());
        self.error = None;
    }

    pub fn show_indicator(&mut self, packages: &[UpgradablePackage]) {
        self.indicator_visible = true;
        self.upgradable_packages = packages.iter().map(|p| p.raw.clone()).collect();
    }

    pub fn hide_indicator(&mut self) {
        self.indicator_visible = false;
        self.upgradable_packages.clear();
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged; a status write failure never stops the daemon.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(event = "status.create_dir_failed", dir = %parent.display(), error = %e);
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!(event = "status.write_failed", path = %path.display(), error = %e);
            }
        }
        Err(e) => warn!(event = "status.serialize_failed", error = %e),
    }
}

/// Truncates the session log at `path`, creating it if needed.
pub fn reset_log(path: &Path) {
    if let Err(e) = std::fs::write(path, "") {
        warn!(event = "status.log_reset_failed", path = %path.display(), error = %e);
    }
}

/// Appends one line to the session log at `path`.
pub fn append_log_line(path: &Path, line: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{line}"));
    if let Err(e) = result {
        warn!(event = "status.log_append_failed", path = %path.display(), error = %e);
    }
}

/// The display side of the daemon: turns events into `status.toml` and
/// `upgrade.log` updates. Owned by the event loop only.
pub struct StatusWriter {
    status_path: PathBuf,
    log_path: PathBuf,
    pub status: DaemonStatus,
}

impl StatusWriter {
    /// Writes a fresh idle status and truncates the session log.
    pub fn new(status_path: &Path, log_path: &Path) -> Self {
        let writer = Self {
            status_path: status_path.to_path_buf(),
            log_path: log_path.to_path_buf(),
            status: DaemonStatus::new(),
        };
        writer.write();
        reset_log(&writer.log_path);
        writer
    }

    pub fn write(&self) {
        write_status(&self.status_path, &self.status);
    }

    pub fn record_error(&mut self, message: String) {
        self.status.error = Some(message);
        self.write();
    }

    /// Applies a display event. Events that don't touch the display are ignored.
    pub fn apply(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::CheckCompleted { packages } => {
                self.status.record_check(&packages);
                self.write();
            }
            // The indicator keeps showing whatever the last good check decided.
            DaemonEvent::CheckFailed(message) => self.record_error(message),
            DaemonEvent::UpgradeStarted => {
                reset_log(&self.log_path);
                self.status.state = DaemonState::Upgrading;
                self.status.error = None;
                self.write();
            }
            DaemonEvent::UpgradeOutput(line) => append_log_line(&self.log_path, &line),
            DaemonEvent::UpgradeFinished {
                exit_code,
                cancelled,
            } => {
                let marker = if cancelled { CANCELLED_MARKER } else { DONE_MARKER };
                append_log_line(&self.log_path, marker);
                self.status.state = DaemonState::Idle;
                self.status.last_upgrade_exit_code = exit_code;
                self.write();
            }
            DaemonEvent::UpgradeRequested
            | DaemonEvent::ConfigReloaded(_)
            | DaemonEvent::Shutdown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packages(lines: &[&str]) -> Vec<UpgradablePackage> {
        lines.iter().map(|l| UpgradablePackage::parse(l)).collect()
    }

    // ── DaemonStatus::new ─────────────────────────────────────────────────────

    #[test]
    fn new_starts_idle_and_hidden() {
        let s = DaemonStatus::new();
        assert_eq!(s.state, DaemonState::Idle);
        assert!(!s.indicator_visible);
        assert!(s.upgradable_packages.is_empty());
        assert!(s.last_check.is_none());
        assert!(s.error.is_none());
        assert_eq!(s.version, env!("CARGO_PKG_VERSION"));
    }

    // ── indicator ─────────────────────────────────────────────────────────────

    #[test]
    fn record_check_shows_and_hides_indicator() {
        let mut s = DaemonStatus::new();
        s.error = Some("stale".to_string());

        s.record_check(&packages(&["curl/stable 8.0 amd64 [upgradable from: 7.9]"]));
        assert!(s.indicator_visible);
        assert_eq!(
            s.upgradable_packages,
            vec!["curl/stable 8.0 amd64 [upgradable from: 7.9]"]
        );
        assert!(s.last_check.is_some());
        assert!(s.error.is_none());

        s.record_check(&[]);
        assert!(!s.indicator_visible);
        assert!(s.upgradable_packages.is_empty());
    }

    // ── serialization ─────────────────────────────────────────────────────────

    #[test]
    fn state_serializes_to_lowercase() {
        let mut s = DaemonStatus::new();
        let idle = toml::to_string_pretty(&s).unwrap();
        assert!(idle.contains("state = \"idle\""));

        s.state = DaemonState::Upgrading;
        let upgrading = toml::to_string_pretty(&s).unwrap();
        assert!(upgrading.contains("state = \"upgrading\""));
    }

    // ── write_status ──────────────────────────────────────────────────────────

    #[test]
    fn write_status_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("status.toml");
        write_status(&path, &DaemonStatus::new());
        assert!(path.exists());
    }

    #[test]
    fn write_status_content_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");

        let mut original = DaemonStatus::new();
        original.state = DaemonState::Upgrading;
        original.show_indicator(&packages(&["vim/stable 9.1 amd64"]));
        original.last_upgrade_exit_code = Some(100);

        write_status(&path, &original);

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: DaemonStatus = toml::from_str(&content).unwrap();
        assert_eq!(parsed.state, DaemonState::Upgrading);
        assert!(parsed.indicator_visible);
        assert_eq!(parsed.upgradable_packages, vec!["vim/stable 9.1 amd64"]);
        assert_eq!(parsed.last_upgrade_exit_code, Some(100));
    }

    #[test]
    fn write_status_omits_empty_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        write_status(&path, &DaemonStatus::new());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("indicator_visible = false"));
        assert!(!content.contains("upgradable_packages"));
        assert!(!content.contains("last_check"));
        assert!(!content.contains("error"));
    }

    // ── StatusWriter ──────────────────────────────────────────────────────────

    fn read_status(path: &Path) -> DaemonStatus {
        toml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn writer_records_an_upgrade_session() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("status.toml");
        let log_path = dir.path().join("upgrade.log");
        std::fs::write(&log_path, "previous run\n").unwrap();

        let mut writer = StatusWriter::new(&status_path, &log_path);
        assert_eq!(std::fs::read_to_string(&log_path).unwrap(), "");

        writer.apply(DaemonEvent::UpgradeStarted);
        assert_eq!(read_status(&status_path).state, DaemonState::Upgrading);

        writer.apply(DaemonEvent::UpgradeOutput("Reading...".to_string()));
        writer.apply(DaemonEvent::UpgradeOutput("Upgraded: 3 packages".to_string()));
        writer.apply(DaemonEvent::UpgradeFinished {
            exit_code: Some(100),
            cancelled: false,
        });

        assert_eq!(
            std::fs::read_to_string(&log_path).unwrap(),
            "Reading...\nUpgraded: 3 packages\nDone...\n"
        );
        let status = read_status(&status_path);
        assert_eq!(status.state, DaemonState::Idle);
        assert_eq!(status.last_upgrade_exit_code, Some(100));
    }

    #[test]
    fn writer_keeps_indicator_when_a_check_fails() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("status.toml");
        let mut writer = StatusWriter::new(&status_path, &dir.path().join("upgrade.log"));

        writer.apply(DaemonEvent::CheckCompleted {
            packages: packages(&["curl/stable 8.0 amd64"]),
        });
        writer.apply(DaemonEvent::CheckFailed("lock held".to_string()));

        let status = read_status(&status_path);
        assert!(status.indicator_visible);
        assert_eq!(status.upgradable_packages, vec!["curl/stable 8.0 amd64"]);
        assert_eq!(status.error.as_deref(), Some("lock held"));
    }

    #[test]
    fn writer_marks_cancelled_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("upgrade.log");
        let mut writer = StatusWriter::new(&dir.path().join("status.toml"), &log_path);

        writer.apply(DaemonEvent::UpgradeStarted);
        writer.apply(DaemonEvent::UpgradeFinished {
            exit_code: None,
            cancelled: true,
        });

        assert_eq!(std::fs::read_to_string(&log_path).unwrap(), "Cancelled...\n");
        assert_eq!(writer.status.last_upgrade_exit_code, None);
    }

    // ── session log ───────────────────────────────────────────────────────────

    #[test]
    fn log_is_reset_then_appended_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upgrade.log");
        std::fs::write(&path, "old session\n").unwrap();

        reset_log(&path);
        append_log_line(&path, "Reading...");
        append_log_line(&path, "Done...");

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Reading...\nDone...\n");
    }
}
