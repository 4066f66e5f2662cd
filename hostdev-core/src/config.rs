//! Agent configuration.

use crate::error::{HostdevError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable carrying the node this agent manages.
pub const NODE_NAME_ENV: &str = "NODE_NAME";

/// Configuration for the hostdev agent.
///
/// Sysfs roots are configurable so the scanners and binders can be
/// pointed at a snapshot tree in tests; production always uses the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name of the node this agent runs on. All records it owns carry
    /// this as their node affinity.
    pub node_name: String,
    /// Directory where the kubelet expects device-plugin sockets.
    pub kubelet_plugin_dir: PathBuf,
    /// Root of the PCI device tree.
    pub pci_devices_root: PathBuf,
    /// Root of the PCI driver tree (bind/unbind/new_id control files).
    pub pci_drivers_root: PathBuf,
    /// Root of the USB device tree.
    pub usb_devices_root: PathBuf,
    /// Root of the mediated-device bus class tree.
    pub mdev_bus_root: PathBuf,
    /// Host /dev mount, prefix for device nodes handed to containers.
    pub dev_root: PathBuf,
    /// How often the background hardware re-scan runs.
    pub rescan_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            kubelet_plugin_dir: PathBuf::from(hostdev_api::DEVICE_PLUGIN_DIR),
            pci_devices_root: PathBuf::from("/sys/bus/pci/devices"),
            pci_drivers_root: PathBuf::from("/sys/bus/pci/drivers"),
            usb_devices_root: PathBuf::from("/sys/bus/usb/devices"),
            mdev_bus_root: PathBuf::from("/sys/class/mdev_bus"),
            dev_root: PathBuf::from("/dev"),
            rescan_interval_secs: 60,
        }
    }
}

impl AgentConfig {
    /// Build a config from the environment. The node name is mandatory:
    /// without it the agent cannot tell which records it owns.
    pub fn from_env() -> Result<Self> {
        let node_name = std::env::var(NODE_NAME_ENV).map_err(|_| HostdevError::InvalidConfig {
            reason: format!("{} is not set", NODE_NAME_ENV),
        })?;
        Ok(Self { node_name, ..Self::default() })
    }

    /// Path to the kubelet's registration socket.
    pub fn kubelet_socket(&self) -> PathBuf {
        self.kubelet_plugin_dir.join(hostdev_api::KUBELET_SOCKET_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let config = AgentConfig::default();
        assert_eq!(config.pci_devices_root, PathBuf::from("/sys/bus/pci/devices"));
        assert_eq!(
            config.kubelet_socket(),
            PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock")
        );
    }

    #[test]
    fn test_config_round_trip() {
        let config = AgentConfig { node_name: "node1".into(), ..AgentConfig::default() };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.node_name, "node1");
        assert_eq!(parsed.rescan_interval_secs, 60);
    }
}
