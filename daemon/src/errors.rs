use std::io;
use std::path::PathBuf;

/// Errors raised by the availability monitor and the upgrade runner.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("package manager `{name}` not found on PATH: {source}")]
    ExecutableNotFound {
        name: String,
        #[source]
        source: which::Error,
    },

    #[error("package query via {} failed: {reason}", .executable.display())]
    Query { executable: PathBuf, reason: String },

    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("an upgrade is already running")]
    UpgradeInProgress,
}

impl MonitorError {
    /// Stable error code written to the status file.
    pub fn error_code(&self) -> &'static str {
        match self {
            MonitorError::ExecutableNotFound { .. } => "executable_not_found",
            MonitorError::Query { .. } => "query_failed",
            MonitorError::Spawn { .. } => "spawn_failed",
            MonitorError::UpgradeInProgress => "upgrade_in_progress",
        }
    }

    /// Transient errors leave the daemon running and are retried by the next poll
    /// or the next user request.
    pub fn is_transient(&self) -> bool {
        !matches!(self, MonitorError::ExecutableNotFound { .. })
    }
}
