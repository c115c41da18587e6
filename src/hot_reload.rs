//! Permission file hot-reload.
//!
//! [`ConfigWatcher`] turns filesystem notifications for the permission file
//! into [`ReloadEvent`]s; [`spawn_permission_reload_task`] debounces them and
//! reloads the shared [`PermissionStore`]. Explicit reloads through
//! [`PermissionStore::reload`] keep working without any of this.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::ConfigError;
use crate::permissions::PermissionStore;

/// Window in which rapid events collapse into one reload.
pub const DEBOUNCE_DURATION: Duration = Duration::from_millis(500);

/// Events that request a permission reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadEvent {
    /// The watched permission file was written, created or replaced.
    FileChanged {
        /// The watched path, not the temporary file an editor may rename.
        path: PathBuf,
    },
    /// Reload requested by an operator.
    Manual,
}

/// Watches permission files and broadcasts [`ReloadEvent`]s.
pub struct ConfigWatcher {
    /// Files registered through [`ConfigWatcher::watch`].
    watched_paths: Vec<PathBuf>,
    /// Fan-out to every subscribed reload task.
    tx: broadcast::Sender<ReloadEvent>,
    /// Kept alive for as long as the watcher; dropping one stops its events.
    watchers: Vec<RecommendedWatcher>,
}

impl ConfigWatcher {
    /// Create a watcher with no paths and a 16-event broadcast buffer.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            watched_paths: Vec::new(),
            tx,
            watchers: Vec::new(),
        }
    }

    /// Start watching `path`.
    ///
    /// The parent directory is watched so that editors which replace the file
    /// instead of writing in place are still noticed.
    pub fn watch(&mut self, path: impl Into<PathBuf>) -> Result<(), ConfigError> {
        let path = path.into();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(|n| n.to_os_string());
        let tx = self.tx.clone();
        let target = path.clone();

        let watch_err = |e: notify::Error| ConfigError::Watch {
            path: path.clone(),
            reason: e.to_string(),
        };

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "Permission file watcher error");
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            let touched = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if touched {
                let _ = tx.send(ReloadEvent::FileChanged {
                    path: target.clone(),
                });
            }
        })
        .map_err(watch_err)?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(watch_err)?;
        tracing::info!(path = %path.display(), "Watching permission file for changes");
        self.watched_paths.push(path);
        self.watchers.push(watcher);
        Ok(())
    }

    /// Receive every event sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.tx.subscribe()
    }

    /// Request a reload without a filesystem event.
    pub fn trigger_reload(&self, event: ReloadEvent) {
        let _ = self.tx.send(event);
    }

    /// Paths being watched, in registration order.
    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watched_paths
    }
}

impl Default for ConfigWatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a task that reloads `store` on every debounced batch of events.
///
/// The task ends when every sender of the channel is dropped.
pub fn spawn_permission_reload_task(
    rx: broadcast::Receiver<ReloadEvent>,
    store: Arc<PermissionStore>,
) -> JoinHandle<()> {
    tokio::spawn(reload_loop(rx, store))
}

async fn reload_loop(mut rx: broadcast::Receiver<ReloadEvent>, store: Arc<PermissionStore>) {
    tracing::info!("Permission hot-reload task started");

    loop {
        let first_event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Closed) => {
                tracing::info!("Permission reload channel closed, stopping hot-reload task");
                return;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(lagged = n, "Permission reload receiver lagged, reloading");
                ReloadEvent::Manual
            }
        };
        tracing::debug!(event = ?first_event, "Permission reload event received");

        tokio::time::sleep(DEBOUNCE_DURATION).await;
        let mut coalesced: u64 = 0;
        loop {
            match rx.try_recv() {
                Ok(_) => coalesced += 1,
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => {
                    tracing::info!(
                        "Permission reload channel closed during debounce, stopping hot-reload task"
                    );
                    return;
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    coalesced += n;
                    break;
                }
            }
        }
        if coalesced > 0 {
            tracing::debug!(coalesced, "Coalesced reload events during debounce window");
        }

        let reload_store = Arc::clone(&store);
        match tokio::task::spawn_blocking(move || reload_store.reload()).await {
            Ok(Ok(())) => {}
            // Already logged by the store; it now serves default-deny rules.
            Ok(Err(_)) => {}
            Err(e) => tracing::error!(error = %e, "Permission reload task panicked"),
        }
    }
}

/// Watch the store's backing file and keep it reloaded.
///
/// Returns the watcher (which must be kept alive) and the reload task.
pub fn watch_store(
    store: Arc<PermissionStore>,
) -> Result<(ConfigWatcher, JoinHandle<()>), ConfigError> {
    let path: &Path = store.path().ok_or_else(|| ConfigError::InvalidValue {
        key: "permissions_path".to_string(),
        message: "permission store has no backing file".to_string(),
    })?;
    let mut watcher = ConfigWatcher::new();
    watcher.watch(path)?;
    let handle = spawn_permission_reload_task(watcher.subscribe(), Arc::clone(&store));
    Ok((watcher, handle))
}
