mod config;
mod errors;
mod event;
mod monitor;
mod paths;
mod query;
mod status;
mod upgrade;
mod watcher;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::event::DaemonEvent;
use crate::monitor::Monitor;
use crate::paths::AppPaths;
use crate::status::StatusWriter;
use crate::upgrade::{UpgradeHandle, UpgradeRunner, UpgradeSession};

#[derive(Parser, Debug)]
#[command(name = "upgrade-monitor-daemon", version)]
#[command(about = "Watches for available OS package upgrades and runs them on request", long_about = None)]
struct Cli {
    /// App data directory holding config.toml, status.toml and upgrade.log.
    #[arg(long)]
    dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Run the daemon in the foreground (default).
    Run,
    /// Query the package manager once and print upgradable packages.
    Check,
    /// Ask a running daemon to start an upgrade.
    RequestUpgrade,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = match AppPaths::resolve_with(cli.dir.as_deref()) {
        Ok(paths) => match cli.command.unwrap_or(Commands::Run) {
            Commands::Run => run_daemon(paths).await,
            Commands::Check => check_once(&paths).await,
            Commands::RequestUpgrade => watcher::request_upgrade(&paths),
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(event = "daemon.failed", error = %format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn check_once(paths: &AppPaths) -> Result<()> {
    let config = config::load_or_default(&paths.config)?;
    let (tx, mut rx) = mpsc::channel(1);
    let monitor = Monitor::new(&config.monitor, tx);
    monitor.resolve()?;
    monitor.check().await?;

    if let Some(DaemonEvent::CheckCompleted { packages }) = rx.recv().await {
        if packages.is_empty() {
            println!("No upgrades available");
        } else {
            println!("{} upgradable package(s):", packages.len());
            for p in &packages {
                println!(
                    "  {:<32} {:>24} -> {:<24} {} {}",
                    p.name,
                    p.from_version.as_deref().unwrap_or("-"),
                    p.version.as_deref().unwrap_or("-"),
                    p.arch.as_deref().unwrap_or(""),
                    p.suite.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

async fn run_daemon(paths: AppPaths) -> Result<()> {
    std::fs::create_dir_all(&paths.dir)
        .with_context(|| format!("Failed to create app data directory {}", paths.dir.display()))?;

    // ── Configuration ─────────────────────────────────────────────────────────
    let mut current_config = config::load_or_default(&paths.config).unwrap_or_else(|e| {
        error!(event = "config.load_failed", error = %format!("{e:#}"));
        config::Config::default()
    });

    // ── Initial status ────────────────────────────────────────────────────────
    let mut display = StatusWriter::new(&paths.status, &paths.log);

    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(64);
    let token = CancellationToken::new();

    // ── Monitor ───────────────────────────────────────────────────────────────
    let monitor = Monitor::new(&current_config.monitor, event_tx.clone());
    let poll_handle = match monitor.setup(token.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            display.record_error(e.to_string());
            return Err(e).context("Unable to start the update monitor");
        }
    };
    let mut runner = UpgradeRunner::new(
        current_config.upgrade.clone(),
        monitor.clone(),
        event_tx.clone(),
    );

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(watcher::watch_app_dir(
        paths.clone(),
        event_tx.clone(),
        token.clone(),
    ));
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            let _ = tx.send(DaemonEvent::Shutdown).await;
        });
    }

    info!(
        event = "daemon.started",
        version = env!("CARGO_PKG_VERSION"),
        dir = %paths.dir.display(),
        polling = monitor.is_started()
    );

    // ── Event loop ────────────────────────────────────────────────────────────
    let mut active_upgrade: Option<UpgradeHandle> = None;

    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::UpgradeRequested => match runner.run(token.child_token()) {
                Ok(handle) => {
                    info!(event = "daemon.upgrade_accepted", session = ?handle.session.status());
                    active_upgrade = Some(handle);
                }
                Err(e) => {
                    warn!(event = "daemon.upgrade_rejected", code = e.error_code(), error = %e);
                    display.record_error(e.to_string());
                }
            },

            DaemonEvent::ConfigReloaded(new_config) => {
                info!(event = "config.reloaded");
                if new_config.monitor.package_manager != current_config.monitor.package_manager
                    || new_config.monitor.header_lines != current_config.monitor.header_lines
                {
                    warn!(event = "config.restart_required", field = "monitor");
                }
                monitor.set_poll_interval(new_config.monitor.poll_interval());
                runner.set_config(new_config.upgrade.clone());
                current_config = new_config;
            }

            DaemonEvent::Shutdown => {
                info!(
                    event = "daemon.shutting_down",
                    upgrade_running = runner.is_running(),
                    indicator_visible = monitor.is_visible()
                );
                break;
            }

            evt @ DaemonEvent::UpgradeFinished { .. } => {
                if let Some(handle) = active_upgrade.take() {
                    info!(
                        event = "daemon.upgrade_finished",
                        lines = handle.session.log().len(),
                        exit_code = ?handle.session.exit_code()
                    );
                }
                display.apply(evt);
            }

            evt => display.apply(evt),
        }
    }

    token.cancel();
    if let Some(handle) = active_upgrade.take() {
        let session = finish_upgrade(handle, &mut event_rx, &mut display).await;
        info!(event = "daemon.upgrade_stopped", session = ?session.status());
    }
    // Nobody reads events any more; closing the receiver lets senders bail out.
    drop(event_rx);
    if let Some(handle) = poll_handle {
        let _ = handle.await;
    }
    display.status.state = status::DaemonState::Idle;
    display.write();

    info!(event = "daemon.stopped");
    Ok(())
}

/// Waits for a cancelled upgrade to stop while still applying its events, so
/// queued output and the final marker reach `upgrade.log` and `status.toml`.
async fn finish_upgrade(
    handle: UpgradeHandle,
    events: &mut mpsc::Receiver<DaemonEvent>,
    display: &mut StatusWriter,
) -> Arc<UpgradeSession> {
    let wait = handle.wait();
    tokio::pin!(wait);
    let session = loop {
        tokio::select! {
            session = &mut wait => break session,
            Some(evt) = events.recv() => display.apply(evt),
        }
    };
    while let Ok(evt) = events.try_recv() {
        display.apply(evt);
    }
    session
}

/// Resolves on SIGINT (Ctrl+C) or, on unix, SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!(event = "daemon.signal_received", signal = "SIGINT");
                    }
                    _ = sigterm.recv() => {
                        info!(event = "daemon.signal_received", signal = "SIGTERM");
                    }
                }
                return;
            }
            Err(e) => warn!(event = "daemon.sigterm_unavailable", error = %e),
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        info!(event = "daemon.signal_received", signal = "SIGINT");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{MonitorConfig, UpgradeConfig};
    use crate::query::test_support::write_script;
    use crate::status::{DaemonState, DaemonStatus};
    use crate::upgrade::{CANCELLED_MARKER, DONE_MARKER};
    use std::time::Duration;

    fn runner_with_helper(
        dir: &std::path::Path,
        body: &str,
    ) -> (UpgradeRunner, mpsc::Receiver<DaemonEvent>) {
        let apt = write_script(dir, "apt", "echo Listing...");
        let helper = write_script(dir, "helper", body);
        let (tx, rx) = mpsc::channel(64);
        let monitor = Monitor::new(
            &MonitorConfig {
                package_manager: apt.to_string_lossy().into_owned(),
                ..MonitorConfig::default()
            },
            tx.clone(),
        );
        let runner = UpgradeRunner::new(
            UpgradeConfig {
                privilege_helper: helper.to_string_lossy().into_owned(),
                ..UpgradeConfig::default()
            },
            monitor,
            tx,
        );
        (runner, rx)
    }

    fn read_status(paths: &AppPaths) -> DaemonStatus {
        toml::from_str(&std::fs::read_to_string(&paths.status).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn shutdown_keeps_queued_output_of_a_finished_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path());
        let mut display = StatusWriter::new(&paths.status, &paths.log);
        let (runner, mut rx) = runner_with_helper(dir.path(), "echo Reading...\necho 'Upgraded: 3 packages'\nexit 3");
        let token = CancellationToken::new();

        // Nothing reads the events until shutdown, as when Shutdown is queued
        // behind the upgrade's output.
        let handle = runner.run(token.child_token()).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
        finish_upgrade(handle, &mut rx, &mut display).await;

        assert_eq!(
            std::fs::read_to_string(&paths.log).unwrap(),
            format!("Reading...\nUpgraded: 3 packages\n{DONE_MARKER}\n")
        );
        let status = read_status(&paths);
        assert_eq!(status.state, DaemonState::Idle);
        assert_eq!(status.last_upgrade_exit_code, Some(3));
    }

    #[tokio::test]
    async fn shutdown_records_a_cancelled_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path());
        let mut display = StatusWriter::new(&paths.status, &paths.log);
        let (runner, mut rx) = runner_with_helper(dir.path(), "echo starting\nexec sleep 30");
        let token = CancellationToken::new();

        let handle = runner.run(token.child_token()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
        let session = finish_upgrade(handle, &mut rx, &mut display).await;

        assert_eq!(session.log(), vec!["starting", CANCELLED_MARKER]);
        assert_eq!(
            std::fs::read_to_string(&paths.log).unwrap(),
            format!("starting\n{CANCELLED_MARKER}\n")
        );
        let status = read_status(&paths);
        assert_eq!(status.state, DaemonState::Idle);
        assert_eq!(status.last_upgrade_exit_code, None);
    }
}
