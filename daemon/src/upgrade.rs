use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::UpgradeConfig;
use crate::errors::MonitorError;
use crate::event::DaemonEvent;
use crate::monitor::Monitor;

/// Appended to the session log once the upgrade process has exited.
pub const DONE_MARKER: &str = "Done...";
/// Appended instead of [`DONE_MARKER`] when the daemon shut down mid-upgrade.
pub const CANCELLED_MARKER: &str = "Cancelled...";
/// How long output is still read after the upgrade process exits. A background
/// child that inherited the pipes must not keep the session open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    Done,
}

#[derive(Debug)]
struct SessionInner {
    status: SessionStatus,
    log: Vec<String>,
    exit_code: Option<i32>,
}

/// One run of the upgrade command and everything it printed.
///
/// Both output pipes append to the same log, so lines from stdout and stderr
/// interleave in arrival order. Within one stream the order is preserved.
#[derive(Debug)]
pub struct UpgradeSession {
    inner: Mutex<SessionInner>,
}

impl UpgradeSession {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                status: SessionStatus::Idle,
                log: Vec::new(),
                exit_code: None,
            }),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    /// Snapshot of the log so far.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Exit code of the upgrade process, once it has exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    fn append(&self, line: String) {
        self.lock().log.push(line);
    }

    fn mark_running(&self) {
        self.lock().status = SessionStatus::Running;
    }

    fn finish(&self, marker: &str, exit_code: Option<i32>) {
        let mut inner = self.lock();
        inner.log.push(marker.to_string());
        inner.exit_code = exit_code;
        inner.status = SessionStatus::Done;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A started upgrade. Dropping the handle detaches the session; it still runs
/// to completion.
pub struct UpgradeHandle {
    pub session: Arc<UpgradeSession>,
    task: JoinHandle<()>,
}

impl UpgradeHandle {
    /// Waits for the session to reach `Done` and its follow-up check to finish.
    pub async fn wait(self) -> Arc<UpgradeSession> {
        if let Err(e) = self.task.await {
            warn!(event = "upgrade.task_failed", error = %e);
        }
        self.session
    }
}

/// Runs the privileged upgrade command, one session at a time.
pub struct UpgradeRunner {
    config: UpgradeConfig,
    monitor: Monitor,
    events: mpsc::Sender<DaemonEvent>,
    running: Arc<AtomicBool>,
}

impl UpgradeRunner {
    pub fn new(config: UpgradeConfig, monitor: Monitor, events: mpsc::Sender<DaemonEvent>) -> Self {
        Self {
            config,
            monitor,
            events,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replaces the command used by the next session.
    pub fn set_config(&mut self, config: UpgradeConfig) {
        self.config = config;
    }

    /// Spawns the upgrade command and streams its output into a new session.
    ///
    /// Fails with [`MonitorError::UpgradeInProgress`] while another session is
    /// running and with [`MonitorError::Spawn`] when the command can't be
    /// started. The exit code is recorded but never turned into an error. Once
    /// the process has exited the monitor runs exactly one availability check.
    /// Cancelling `token` kills the process and skips that check.
    pub fn run(&self, token: CancellationToken) -> Result<UpgradeHandle, MonitorError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MonitorError::UpgradeInProgress);
        }

        let helper = &self.config.privilege_helper;
        let mut child = match Command::new(helper)
            .arg(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                self.running.store(false, Ordering::SeqCst);
                warn!(event = "upgrade.spawn_failed", program = %helper, error = %source);
                return Err(MonitorError::Spawn {
                    program: helper.clone(),
                    source,
                });
            }
        };

        info!(
            event = "upgrade.started",
            helper = %helper,
            program = %self.config.program,
            args = ?self.config.args,
            pid = child.id()
        );

        // Idle only until the process is known to have started.
        let session = Arc::new(UpgradeSession::new());
        session.mark_running();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let running = Arc::clone(&self.running);
        let monitor = self.monitor.clone();
        let events = self.events.clone();
        let task_session = Arc::clone(&session);

        let task = tokio::spawn(async move {
            let session = task_session;
            let _ = events.send(DaemonEvent::UpgradeStarted).await;

            let mut drains: Vec<JoinHandle<()>> = [
                stdout.map(|s| spawn_drain(s, "stdout", &session, &events)),
                stderr.map(|s| spawn_drain(s, "stderr", &session, &events)),
            ]
            .into_iter()
            .flatten()
            .collect();

            let (exit_code, cancelled) = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => (status.code(), false),
                    Err(e) => {
                        warn!(event = "upgrade.wait_failed", error = %e);
                        (None, false)
                    }
                },
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(event = "upgrade.kill_failed", error = %e);
                    }
                    (None, true)
                }
            };

            if cancelled {
                drains.iter().for_each(JoinHandle::abort);
            }
            let drained = tokio::time::timeout(DRAIN_GRACE, async {
                for drain in drains.iter_mut() {
                    let _ = drain.await;
                }
            })
            .await;
            if drained.is_err() {
                warn!(event = "upgrade.drain_timeout", grace_ms = DRAIN_GRACE.as_millis() as u64);
                drains.iter().for_each(JoinHandle::abort);
            }

            if cancelled {
                session.finish(CANCELLED_MARKER, None);
                info!(event = "upgrade.cancelled");
            } else {
                session.finish(DONE_MARKER, exit_code);
                match exit_code {
                    Some(0) => info!(event = "upgrade.completed", exit_code = 0),
                    code => warn!(event = "upgrade.completed", exit_code = ?code),
                }
            }
            running.store(false, Ordering::SeqCst);

            let _ = events
                .send(DaemonEvent::UpgradeFinished {
                    exit_code,
                    cancelled,
                })
                .await;

            if !cancelled {
                // Errors are already logged and reported by the monitor.
                tokio::select! {
                    _ = token.cancelled() => info!(event = "upgrade.recheck_skipped"),
                    _ = monitor.check() => {}
                }
            }
        });

        Ok(UpgradeHandle { session, task })
    }
}

fn spawn_drain<R>(
    reader: R,
    stream: &'static str,
    session: &Arc<UpgradeSession>,
    events: &mpsc::Sender<DaemonEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let session = Arc::clone(session);
    let events = events.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    session.append(line.clone());
                    let _ = events.send(DaemonEvent::UpgradeOutput(line)).await;
                }
                Err(e) => {
                    warn!(event = "upgrade.read_failed", stream, error = %e);
                    break;
                }
            }
        }
    })
}
