//! Device health watching.
//!
//! A session watches the host device nodes it advertises. A node
//! disappearing flips the device to Unhealthy in the next ListAndWatch
//! response; it coming back flips it to Healthy. The plugin socket's
//! directory is watched too: the kubelet wipes it on restart, and a
//! session whose socket is gone can never be allocated against again,
//! so it stops itself and the next reconcile pass starts a fresh one.

use super::server::DevicePlugin;
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Watch the filesystem for the plugin's device nodes and socket.
pub(super) fn spawn_health_watch(plugin: Arc<DevicePlugin>) {
    tokio::spawn(async move {
        if let Err(e) = run(plugin).await {
            warn!(error = %e, "device health watch stopped");
        }
    });
}

async fn run(plugin: Arc<DevicePlugin>) -> notify::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
        // Runs on the notify thread; the unbounded send never blocks.
        let _ = tx.send(res);
    })?;

    let socket_dir = plugin.socket_path().parent().map(Path::to_path_buf);
    if let Some(dir) = &socket_dir {
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
    }

    let mut watched_dirs: HashSet<PathBuf> = HashSet::new();
    let mut path_to_id = refresh_watches(&plugin, &mut watcher, &mut watched_dirs).await;

    let token = plugin.cancellation();
    let mut updates = plugin.subscribe_updates();

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                path_to_id = refresh_watches(&plugin, &mut watcher, &mut watched_dirs).await;
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "filesystem watch error");
                        continue;
                    }
                };
                if handle_event(&plugin, &path_to_id, event).await {
                    warn!(
                        socket = %plugin.socket_path().display(),
                        "plugin socket removed by kubelet, stopping session"
                    );
                    plugin.mark_socket_lost();
                    plugin.stop().await;
                    break;
                }
            }
        }
    }
    Ok(())
}

/// (Re)build the device-path map and start watching any parent
/// directories not yet covered.
async fn refresh_watches(
    plugin: &DevicePlugin,
    watcher: &mut RecommendedWatcher,
    watched_dirs: &mut HashSet<PathBuf>,
) -> HashMap<PathBuf, String> {
    let devices = plugin.devices().lock().await;
    let mut path_to_id = HashMap::new();
    for device in devices.values() {
        for path in &device.device_paths {
            let path = PathBuf::from(path);
            if let Some(parent) = path.parent() {
                if parent.exists() && watched_dirs.insert(parent.to_path_buf()) {
                    if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
                        warn!(dir = %parent.display(), error = %e, "could not watch device directory");
                        watched_dirs.remove(parent);
                    }
                }
            }
            path_to_id.insert(path, device.id.clone());
        }
    }
    path_to_id
}

/// Apply one filesystem event. Returns true when the plugin's own
/// socket was removed, which ends the session.
async fn handle_event(
    plugin: &DevicePlugin,
    path_to_id: &HashMap<PathBuf, String>,
    event: notify::Event,
) -> bool {
    let healthy = match event.kind {
        EventKind::Create(_) => true,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => false,
        _ => return false,
    };

    for path in &event.paths {
        if !healthy && path == plugin.socket_path() {
            return true;
        }
        if let Some(id) = path_to_id.get(path) {
            debug!(path = %path.display(), id = %id, healthy, "device node event");
            plugin.set_health(id, healthy).await;
        }
    }
    false
}
