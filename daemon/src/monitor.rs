use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::errors::MonitorError;
use crate::event::DaemonEvent;
use crate::query;

/// State shared between the polling task, the upgrade runner and the event loop.
struct MonitorState {
    package_manager: String,
    /// Resolved once on first use and reused afterwards.
    executable: OnceLock<PathBuf>,
    visible: AtomicBool,
    poll_interval_ms: AtomicU64,
    startup_delay: Duration,
    header_lines: usize,
    started: AtomicBool,
    /// Serializes queries so a post-upgrade check never overlaps a poll.
    check_lock: Mutex<()>,
}

/// Decides whether the "upgrades available" indicator should be shown.
///
/// Cloning is cheap; all clones share the same state. Only [`Monitor::check`]
/// writes the visibility flag.
#[derive(Clone)]
pub struct Monitor {
    state: Arc<MonitorState>,
    events: mpsc::Sender<DaemonEvent>,
}

impl Monitor {
    pub fn new(config: &MonitorConfig, events: mpsc::Sender<DaemonEvent>) -> Self {
        let state = MonitorState {
            package_manager: config.package_manager.clone(),
            executable: OnceLock::new(),
            visible: AtomicBool::new(false),
            poll_interval_ms: AtomicU64::new(duration_ms(config.poll_interval())),
            startup_delay: config.startup_delay(),
            header_lines: config.header_lines,
            started: AtomicBool::new(false),
            check_lock: Mutex::new(()),
        };
        Self {
            state: Arc::new(state),
            events,
        }
    }

    /// Resolves the package manager and starts the polling task.
    ///
    /// The polling task is started at most once per monitor: later calls reuse
    /// the cached executable and return `Ok(None)`. If the executable cannot be
    /// found, nothing is started.
    pub fn setup(&self, token: CancellationToken) -> Result<Option<JoinHandle<()>>, MonitorError> {
        self.resolve()?;

        if self.state.started.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        let monitor = self.clone();
        Ok(Some(tokio::spawn(async move {
            monitor.poll_loop(token).await;
        })))
    }

    /// Looks the package manager up on PATH, caching the result.
    pub fn resolve(&self) -> Result<&Path, MonitorError> {
        if let Some(path) = self.state.executable.get() {
            return Ok(path.as_path());
        }

        let name = &self.state.package_manager;
        let path = which::which(name).map_err(|source| MonitorError::ExecutableNotFound {
            name: name.clone(),
            source,
        })?;
        info!(
            event = "monitor.executable_resolved",
            name = %name,
            path = %path.display()
        );
        Ok(self.state.executable.get_or_init(|| path).as_path())
    }

    /// Runs one availability query and updates the visibility flag.
    ///
    /// A failed query is reported and returned, but the flag keeps whatever the
    /// last successful query decided.
    pub async fn check(&self) -> Result<bool, MonitorError> {
        let _guard = self.state.check_lock.lock().await;

        let result = match self.resolve() {
            Ok(executable) => {
                let executable = executable.to_path_buf();
                query::list_upgradable(&executable, self.state.header_lines).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(packages) => {
                let visible = !packages.is_empty();
                let previous = self.state.visible.swap(visible, Ordering::SeqCst);
                if previous != visible {
                    info!(
                        event = "monitor.visibility_changed",
                        visible,
                        upgradable = packages.len()
                    );
                } else {
                    debug!(event = "monitor.check_completed", upgradable = packages.len());
                }
                let _ = self.events.send(DaemonEvent::CheckCompleted { packages }).await;
                Ok(visible)
            }
            Err(e) => {
                warn!(event = "monitor.check_failed", error = %e);
                let _ = self.events.send(DaemonEvent::CheckFailed(e.to_string())).await;
                Err(e)
            }
        }
    }

    pub fn is_visible(&self) -> bool {
        self.state.visible.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.state.started.load(Ordering::SeqCst)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.state.poll_interval_ms.load(Ordering::SeqCst))
    }

    /// Takes effect after the sleep currently in progress.
    pub fn set_poll_interval(&self, interval: Duration) {
        self.state
            .poll_interval_ms
            .store(duration_ms(interval), Ordering::SeqCst);
    }

    async fn poll_loop(self, token: CancellationToken) {
        info!(
            event = "monitor.poll_started",
            startup_delay_ms = duration_ms(self.state.startup_delay),
            interval_ms = duration_ms(self.poll_interval())
        );

        tokio::select! {
            _ = token.cancelled() => {
                info!(event = "monitor.poll_stopped");
                return;
            }
            _ = sleep(self.state.startup_delay) => {}
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.check() => {}
            }

            if self.events.is_closed() {
                break;
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(self.poll_interval()) => {}
            }
        }

        info!(event = "monitor.poll_stopped");
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
