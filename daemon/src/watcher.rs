use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config;
use crate::event::DaemonEvent;
use crate::paths::AppPaths;

/// What a filesystem event in the app dir means to the daemon.
#[derive(Debug, PartialEq, Eq)]
enum Trigger {
    ConfigChanged,
    UpgradeRequested,
}

fn classify(event: &notify::Event, paths: &AppPaths) -> Option<Trigger> {
    let is_write = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_));
    if !is_write {
        return None;
    }
    let touches = |target: &Path| event.paths.iter().any(|p| p == target);
    if touches(&paths.request) {
        Some(Trigger::UpgradeRequested)
    } else if touches(&paths.config) {
        Some(Trigger::ConfigChanged)
    } else {
        None
    }
}

/// Watches the app data directory until `token` is cancelled.
///
/// A write to `config.toml` reloads it and sends `ConfigReloaded`. Creating
/// `upgrade.request` consumes the file and sends `UpgradeRequested`.
pub async fn watch_app_dir(paths: AppPaths, tx: mpsc::Sender<DaemonEvent>, token: CancellationToken) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(event = "watcher.create_failed", error = %e);
            return;
        }
    };

    // Watch the directory rather than the files so editor-style atomic saves
    // (write-new + rename) and not-yet-existing request files are seen.
    if let Err(e) = watcher.watch(&paths.dir, RecursiveMode::NonRecursive) {
        warn!(event = "watcher.watch_failed", dir = %paths.dir.display(), error = %e);
        return;
    }
    info!(event = "watcher.started", dir = %paths.dir.display());

    // A request left behind while the daemon was down is honoured on startup.
    if paths.request.exists() && consume_request(&paths.request) {
        let _ = tx.send(DaemonEvent::UpgradeRequested).await;
    }

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = watch_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let sent = match classify(&event, &paths) {
            Some(Trigger::ConfigChanged) => match config::load_or_default(&paths.config) {
                Ok(config) => tx.send(DaemonEvent::ConfigReloaded(config)).await,
                Err(e) => {
                    warn!(event = "watcher.config_reload_failed", error = %e);
                    Ok(())
                }
            },
            Some(Trigger::UpgradeRequested) => {
                if consume_request(&paths.request) {
                    tx.send(DaemonEvent::UpgradeRequested).await
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        };

        if sent.is_err() {
            break;
        }
    }

    info!(event = "watcher.stopped");
}

/// Removes the request file. Returns false if another event already consumed it,
/// so one request never starts two upgrades.
fn consume_request(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(event = "watcher.request_remove_failed", path = %path.display(), error = %e);
            false
        }
    }
}

/// Client side of the request file: asks a running daemon for an upgrade.
pub fn request_upgrade(paths: &AppPaths) -> anyhow::Result<()> {
    use anyhow::Context;
    std::fs::create_dir_all(&paths.dir)
        .with_context(|| format!("Failed to create {}", paths.dir.display()))?;
    std::fs::write(&paths.request, "")
        .with_context(|| format!("Failed to write {}", paths.request.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    fn event(kind: EventKind, path: &Path) -> notify::Event {
        notify::Event::new(kind).add_path(path.to_path_buf())
    }

    #[test]
    fn classify_recognises_config_writes_and_requests() {
        let paths = AppPaths::new(Path::new("/tmp/um"));

        assert_eq!(
            classify(&event(EventKind::Modify(ModifyKind::Any), &paths.config), &paths),
            Some(Trigger::ConfigChanged)
        );
        assert_eq!(
            classify(&event(EventKind::Create(CreateKind::File), &paths.request), &paths),
            Some(Trigger::UpgradeRequested)
        );
    }

    #[test]
    fn classify_ignores_removals_and_unrelated_files() {
        let paths = AppPaths::new(Path::new("/tmp/um"));

        assert_eq!(
            classify(&event(EventKind::Remove(RemoveKind::File), &paths.request), &paths),
            None
        );
        assert_eq!(
            classify(&event(EventKind::Modify(ModifyKind::Any), &paths.status), &paths),
            None
        );
    }

    #[test]
    fn request_is_consumed_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path());

        request_upgrade(&paths).unwrap();
        assert!(paths.request.exists());
        assert!(consume_request(&paths.request));
        assert!(!consume_request(&paths.request));
        assert!(!paths.request.exists());
    }

    #[tokio::test]
    async fn pending_request_is_honoured_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path());
        request_upgrade(&paths).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let task = tokio::spawn(watch_app_dir(paths.clone(), tx, token.clone()));

        assert!(matches!(rx.recv().await, Some(DaemonEvent::UpgradeRequested)));
        assert!(!paths.request.exists());

        token.cancel();
        task.await.unwrap();
    }
}
