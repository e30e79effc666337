//! Filesystem-driven health monitoring.
//!
//! Each plugin instance watches:
//!
//! - the device-plugin directory, to notice the kubelet wiping its socket on
//!   restart;
//! - the per-device health root and every existing per-device path, so that
//!   devices disappearing and reappearing flip health.
//!
//! A device whose path exists is Healthy; a missing path is Unhealthy. The
//! kubelet only hears about actual transitions.

use super::server::PluginServer;
use super::{DeviceKind, Health, HealthEvent};
use crate::error::{PluginError, Result};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a filesystem event means for the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WatchAction {
    Health(HealthEvent),
    /// The plugin socket was removed: the kubelet restarted.
    ManagerRestart,
}

/// Watches of one plugin start. Ends with the start's `term` token.
pub struct HealthMonitor {
    resource: String,
    socket: PathBuf,
    /// Watched per-device path -> advertised id.
    targets: HashMap<PathBuf, String>,
    /// Health of every target when the watches were established.
    initial: Vec<HealthEvent>,
    // Dropping the watcher ends its watches.
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    health_tx: mpsc::Sender<HealthEvent>,
    term: CancellationToken,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    /// Establish every watch for `device_ids` of `kind`.
    ///
    /// Failing to watch the socket directory or an existing path is fatal; a
    /// missing health root is only logged since its devices already report
    /// Unhealthy.
    pub fn watch<K: DeviceKind>(
        kind: &K,
        resource: &str,
        socket: &Path,
        device_ids: &[String],
        health_tx: mpsc::Sender<HealthEvent>,
        term: CancellationToken,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| setup_error(socket, e))?;

        let socket_dir = socket.parent().ok_or_else(|| PluginError::WatcherSetup {
            path: socket.to_path_buf(),
            reason: "socket path has no parent directory".to_string(),
        })?;
        watcher
            .watch(socket_dir, RecursiveMode::NonRecursive)
            .map_err(|e| setup_error(socket_dir, e))?;

        let mut targets = HashMap::new();
        let mut roots = BTreeSet::new();
        let mut initial = Vec::new();
        for id in device_ids {
            let Some(path) = kind.health_path(id) else {
                continue;
            };
            if let Some(root) = path.parent() {
                roots.insert(root.to_path_buf());
            }
            let health = if path.exists() { Health::Healthy } else { Health::Unhealthy };
            initial.push(HealthEvent { id: id.clone(), health });
            targets.insert(path, id.clone());
        }

        for root in &roots {
            if !root.is_dir() {
                warn!(resource = %resource, path = %root.display(), "Health root missing, not watching it");
                continue;
            }
            watcher.watch(root, RecursiveMode::NonRecursive).map_err(|e| setup_error(root, e))?;
        }
        for path in targets.keys().filter(|p| p.exists()) {
            watcher.watch(path, RecursiveMode::NonRecursive).map_err(|e| setup_error(path, e))?;
        }

        debug!(resource = %resource, targets = targets.len(), "Health watches established");
        Ok(Self {
            resource: resource.to_string(),
            socket: socket.to_path_buf(),
            targets,
            initial,
            _watcher: watcher,
            events,
            health_tx,
            term,
            shutdown,
        })
    }

    /// Forward health changes until `term` or `shutdown` fires, restarting
    /// `server` once if the kubelet removes its socket.
    ///
    /// Changes waiting for ListAndWatch are kept per device, latest wins, so a
    /// full health channel never stops the monitor from reading events.
    pub async fn run<K: DeviceKind>(mut self, server: Arc<PluginServer<K>>) {
        let mut pending: BTreeMap<String, Health> =
            std::mem::take(&mut self.initial).into_iter().map(|e| (e.id, e.health)).collect();

        loop {
            tokio::select! {
                biased;
                _ = self.term.cancelled() => return,
                _ = self.shutdown.cancelled() => return,
                event = self.events.recv() => {
                    let event = match event {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            warn!(resource = %self.resource, error = %e, "Filesystem watch error");
                            continue;
                        }
                        None => return,
                    };

                    for action in classify(&event, &self.targets, &self.socket) {
                        match action {
                            WatchAction::Health(event) => {
                                debug!(resource = %self.resource, device = %event.id, health = event.health.as_str(), "Health event");
                                pending.insert(event.id, event.health);
                            }
                            WatchAction::ManagerRestart => {
                                info!(resource = %self.resource, "Plugin socket removed, kubelet restarted");
                                if let Err(e) = Arc::clone(&server).restart().await {
                                    error!(resource = %self.resource, error = %e, "Plugin restart failed");
                                }
                                // The restarted instance runs its own monitor.
                                return;
                            }
                        }
                    }
                }
                permit = self.health_tx.reserve(), if !pending.is_empty() => {
                    let Ok(permit) = permit else {
                        return;
                    };
                    if let Some((id, health)) = pending.pop_first() {
                        permit.send(HealthEvent { id, health });
                    }
                }
            }
        }
    }
}

/// Map one filesystem event to plugin actions.
pub(crate) fn classify(
    event: &Event,
    targets: &HashMap<PathBuf, String>,
    socket: &Path,
) -> Vec<WatchAction> {
    let mut actions = Vec::new();

    for path in &event.paths {
        if path == socket {
            if matches!(event.kind, EventKind::Remove(_)) {
                actions.push(WatchAction::ManagerRestart);
            }
            continue;
        }

        let Some(id) = targets.get(path) else {
            continue;
        };
        let health = match event.kind {
            EventKind::Create(_) => Health::Healthy,
            EventKind::Remove(_) => Health::Unhealthy,
            EventKind::Modify(ModifyKind::Name(_)) => {
                if path.exists() {
                    Health::Healthy
                } else {
                    Health::Unhealthy
                }
            }
            _ => continue,
        };
        actions.push(WatchAction::Health(HealthEvent { id: id.clone(), health }));
    }

    actions
}

fn setup_error(path: &Path, err: notify::Error) -> PluginError {
    PluginError::WatcherSetup { path: path.to_path_buf(), reason: err.to_string() }
}
