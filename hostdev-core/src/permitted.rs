//! Permitted host device configuration.
//!
//! The virtualization layer only schedules a passthrough device into a
//! VM when the device's resource pool is listed in its permitted host
//! devices config. The engines maintain that list with read-modify-write
//! cycles: fetch, apply a pure edit, and push back only when the edit
//! changed something.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// One permitted PCI model, matched by vendor:device selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PciHostDeviceEntry {
    pub resource_name: String,
    /// "10de:1eb8" form.
    pub vendor_selector: String,
    /// True: our device plugin advertises the pool, not the
    /// virtualization layer's built-in one.
    pub external_resource_provider: bool,
}

/// One permitted USB model, matched by vendor/product pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbHostDeviceEntry {
    pub resource_name: String,
    pub vendor: String,
    pub product: String,
    pub external_resource_provider: bool,
}

/// The permitted host devices document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermittedHostDevices {
    #[serde(default)]
    pub pci_host_devices: Vec<PciHostDeviceEntry>,
    #[serde(default)]
    pub usb_host_devices: Vec<UsbHostDeviceEntry>,
}

impl PermittedHostDevices {
    /// Add a PCI entry unless an identical one is present. Returns
    /// whether the document changed.
    pub fn ensure_pci(&mut self, entry: PciHostDeviceEntry) -> bool {
        if self.pci_host_devices.iter().any(|e| *e == entry) {
            return false;
        }
        // Same pool under a different selector would shadow the new
        // entry; replace rather than append.
        self.pci_host_devices.retain(|e| e.resource_name != entry.resource_name);
        self.pci_host_devices.push(entry);
        true
    }

    /// Drop the PCI entry for a resource pool. Returns whether the
    /// document changed.
    pub fn remove_pci(&mut self, resource_name: &str) -> bool {
        let before = self.pci_host_devices.len();
        self.pci_host_devices.retain(|e| e.resource_name != resource_name);
        self.pci_host_devices.len() != before
    }

    /// Add or update a USB entry in place. An entry with the same
    /// resource name but a different vendor/product pair is rewritten
    /// rather than duplicated. Returns whether the document changed.
    pub fn upsert_usb(&mut self, entry: UsbHostDeviceEntry) -> bool {
        if let Some(existing) = self
            .usb_host_devices
            .iter_mut()
            .find(|e| e.resource_name == entry.resource_name)
        {
            if *existing == entry {
                return false;
            }
            *existing = entry;
            return true;
        }
        self.usb_host_devices.push(entry);
        true
    }

    pub fn remove_usb(&mut self, resource_name: &str) -> bool {
        let before = self.usb_host_devices.len();
        self.usb_host_devices.retain(|e| e.resource_name != resource_name);
        self.usb_host_devices.len() != before
    }

    pub fn has_pci(&self, resource_name: &str) -> bool {
        self.pci_host_devices.iter().any(|e| e.resource_name == resource_name)
    }
}

/// Client for the cluster-held permitted devices document.
#[async_trait]
pub trait PermittedDeviceClient: Send + Sync {
    async fn get(&self) -> Result<PermittedHostDevices>;
    async fn update(&self, devices: PermittedHostDevices) -> Result<()>;
}

/// In-process document holder backing the agent binary and tests.
#[derive(Debug, Default)]
pub struct MemoryPermittedDevices {
    inner: RwLock<PermittedHostDevices>,
}

impl MemoryPermittedDevices {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PermittedDeviceClient for MemoryPermittedDevices {
    async fn get(&self) -> Result<PermittedHostDevices> {
        Ok(self.inner.read().await.clone())
    }

    async fn update(&self, devices: PermittedHostDevices) -> Result<()> {
        *self.inner.write().await = devices;
        Ok(())
    }
}

/// Selector string for a PCI model, "10de:1eb8" form.
pub fn vendor_selector(vendor_id: u16, device_id: u16) -> String {
    format!("{:04x}:{:04x}", vendor_id, device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pci_entry() -> PciHostDeviceEntry {
        PciHostDeviceEntry {
            resource_name: "nvidia.com/1eb8".into(),
            vendor_selector: "10de:1eb8".into(),
            external_resource_provider: true,
        }
    }

    #[test]
    fn test_ensure_pci_is_idempotent() {
        let mut permitted = PermittedHostDevices::default();
        assert!(permitted.ensure_pci(pci_entry()));
        assert!(!permitted.ensure_pci(pci_entry()));
        assert_eq!(permitted.pci_host_devices.len(), 1);
    }

    #[test]
    fn test_ensure_pci_replaces_stale_selector() {
        let mut permitted = PermittedHostDevices::default();
        permitted.ensure_pci(PciHostDeviceEntry {
            vendor_selector: "10de:0000".into(),
            ..pci_entry()
        });
        assert!(permitted.ensure_pci(pci_entry()));
        assert_eq!(permitted.pci_host_devices.len(), 1);
        assert_eq!(permitted.pci_host_devices[0].vendor_selector, "10de:1eb8");
    }

    #[test]
    fn test_remove_pci() {
        let mut permitted = PermittedHostDevices::default();
        permitted.ensure_pci(pci_entry());
        assert!(permitted.remove_pci("nvidia.com/1eb8"));
        assert!(!permitted.remove_pci("nvidia.com/1eb8"));
        assert!(permitted.pci_host_devices.is_empty());
    }

    #[test]
    fn test_upsert_usb_updates_in_place() {
        let mut permitted = PermittedHostDevices::default();
        let entry = UsbHostDeviceEntry {
            resource_name: "kubevirt.io/storage".into(),
            vendor: "0951".into(),
            product: "1666".into(),
            external_resource_provider: true,
        };
        assert!(permitted.upsert_usb(entry.clone()));
        assert!(!permitted.upsert_usb(entry.clone()));

        // Device swapped behind the same pool name.
        let replacement = UsbHostDeviceEntry { product: "1667".into(), ..entry };
        assert!(permitted.upsert_usb(replacement));
        assert_eq!(permitted.usb_host_devices.len(), 1);
        assert_eq!(permitted.usb_host_devices[0].product, "1667");
    }

    #[test]
    fn test_selector_format() {
        assert_eq!(vendor_selector(0x10de, 0x1eb8), "10de:1eb8");
    }
}
