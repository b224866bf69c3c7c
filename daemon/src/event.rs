use crate::config::Config;
use crate::query::UpgradablePackage;

pub enum DaemonEvent {
    /// An availability query succeeded. An empty list hides the indicator.
    CheckCompleted { packages: Vec<UpgradablePackage> },
    /// An availability query failed; the indicator keeps its previous state.
    CheckFailed(String),
    /// Someone asked for an upgrade (request file dropped into the app dir).
    UpgradeRequested,
    /// The upgrade subprocess was spawned; a fresh session log begins.
    UpgradeStarted,
    /// One line read from the upgrade subprocess's stdout or stderr.
    UpgradeOutput(String),
    /// The upgrade session reached `Done`. `exit_code` is `None` when the process
    /// was killed by a signal or the session was cancelled.
    UpgradeFinished {
        exit_code: Option<i32>,
        cancelled: bool,
    },
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// SIGINT/SIGTERM received; the daemon should write final state and exit.
    Shutdown,
}
