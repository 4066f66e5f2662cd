//! Session registry.
//!
//! One [`DevicePlugin`] per resource pool, created when the pool's
//! first device is enabled and stopped when its last device goes away.
//! The map lock is held across session start and stop, so two claims
//! landing on the same pool at once cannot race a second session into
//! existence.

use super::server::{DevicePlugin, LifecycleState, PluginDevice};
use crate::error::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub struct PluginRegistry {
    plugins: Mutex<HashMap<String, Arc<DevicePlugin>>>,
    plugin_dir: PathBuf,
    kubelet_socket: PathBuf,
}

impl PluginRegistry {
    pub fn new(plugin_dir: impl Into<PathBuf>, kubelet_socket: impl Into<PathBuf>) -> Self {
        Self {
            plugins: Mutex::new(HashMap::new()),
            plugin_dir: plugin_dir.into(),
            kubelet_socket: kubelet_socket.into(),
        }
    }

    /// Advertise a device under a resource pool, creating and
    /// registering the pool's session if this is its first device.
    /// A session that fails to register is not kept, so the next
    /// reconcile attempt retries from scratch.
    pub async fn ensure_device(
        &self,
        resource_name: &str,
        env_prefix: &str,
        device: PluginDevice,
    ) -> Result<()> {
        let mut plugins = self.plugins.lock().await;
        if let Some(plugin) = plugins.get(resource_name) {
            if plugin.lifecycle() != LifecycleState::Stopped {
                plugin.add_device(device).await;
                return Ok(());
            }
            // The session died under us (kubelet wiped its socket); a
            // stopped session cannot restart, so build a fresh one.
            plugins.remove(resource_name);
        }

        let plugin = Arc::new(DevicePlugin::new(
            resource_name,
            env_prefix,
            &self.plugin_dir,
            self.kubelet_socket.clone(),
        ));
        plugin.add_device(device).await;
        plugin.clone().start().await?;
        info!(resource = %resource_name, "device plugin session started");
        plugins.insert(resource_name.to_string(), plugin);
        Ok(())
    }

    /// Withdraw a device from its pool. The session stops and is
    /// evicted when the pool empties. Returns true when the whole pool
    /// went away.
    pub async fn remove_device(&self, resource_name: &str, id: &str) -> bool {
        let mut plugins = self.plugins.lock().await;
        let Some(plugin) = plugins.get(resource_name) else {
            return false;
        };
        if plugin.remove_device(id).await > 0 {
            return false;
        }
        let plugin = plugins.remove(resource_name);
        drop(plugins);
        if let Some(plugin) = plugin {
            plugin.stop().await;
            info!(resource = %resource_name, "device plugin session stopped");
        }
        true
    }

    pub async fn has_plugin(&self, resource_name: &str) -> bool {
        self.plugins.lock().await.contains_key(resource_name)
    }

    pub async fn has_device(&self, resource_name: &str, id: &str) -> bool {
        match self.plugins.lock().await.get(resource_name) {
            Some(plugin) => plugin.has_device(id).await,
            None => false,
        }
    }

    pub async fn plugin_count(&self) -> usize {
        self.plugins.lock().await.len()
    }

    /// Stop every session. Used on agent shutdown so the kubelet sees
    /// the pools drain instead of finding dead sockets later.
    pub async fn stop_all(&self) {
        let mut plugins = self.plugins.lock().await;
        for (resource, plugin) in plugins.drain() {
            plugin.stop().await;
            info!(resource = %resource, "device plugin session stopped");
        }
    }
}
