//! PCI bus scanner.

use super::{read_link_basename, read_sysfs_hex, read_sysfs_value};
use crate::error::Result;
use crate::types::{device_record_name, vendor_word, PciDevice, PciDeviceStatus};
use crate::types::ObjectMeta;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Regular expression to validate PCI address format: 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// Validate PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// Reads the PCI device tree and produces one record per address.
#[derive(Debug, Clone)]
pub struct PciScanner {
    devices_root: PathBuf,
}

impl PciScanner {
    pub fn new(devices_root: impl Into<PathBuf>) -> Self {
        Self { devices_root: devices_root.into() }
    }

    /// Scan every device on the bus and build records for this node.
    /// Devices whose attributes cannot be read are skipped with a
    /// warning rather than failing the whole scan.
    pub fn scan(&self, node_name: &str) -> Result<Vec<PciDevice>> {
        let mut devices = Vec::new();
        let entries = fs::read_dir(&self.devices_root)
            .map_err(|e| crate::error::HostdevError::io(&self.devices_root, e))?;

        for entry in entries.flatten() {
            let address = entry.file_name().to_string_lossy().to_string();
            if !is_valid_pci_address(&address) {
                continue;
            }
            match self.read_device(&address, node_name) {
                Ok(device) => devices.push(device),
                Err(e) => warn!(address = %address, error = %e, "skipping unreadable PCI device"),
            }
        }

        debug!(count = devices.len(), "PCI scan complete");
        Ok(devices)
    }

    /// Read one device's identity and driver binding from sysfs.
    pub fn read_device(&self, address: &str, node_name: &str) -> Result<PciDevice> {
        let device_path = self.devices_root.join(address);
        let vendor_id = read_sysfs_hex(&device_path.join("vendor"))?;
        let device_id = read_sysfs_hex(&device_path.join("device"))?;
        let driver = read_link_basename(&device_path.join("driver")).unwrap_or_default();
        let iommu_group = read_link_basename(&device_path.join("iommu_group"));

        let name = device_record_name(node_name, vendor_id, device_id, address);
        Ok(PciDevice {
            metadata: ObjectMeta::named(name),
            status: PciDeviceStatus {
                address: address.to_string(),
                vendor_id,
                device_id,
                node_name: node_name.to_string(),
                description: describe_device(vendor_id, device_id),
                kernel_driver_in_use: driver,
                resource_name: pci_resource_name(vendor_id, device_id),
                iommu_group,
            },
        })
    }

    /// Current driver binding for an address, if any.
    pub fn current_driver(&self, address: &str) -> Option<String> {
        read_link_basename(&self.devices_root.join(address).join("driver"))
    }

    /// Whether the device's class marks it as a GPU.
    pub fn is_gpu(&self, address: &str) -> bool {
        let class_path = self.devices_root.join(address).join("class");
        read_sysfs_value(&class_path)
            .map(|class| {
                class.starts_with("0x0300") // VGA compatible
                    || class.starts_with("0x0302") // 3D controller
                    || class.starts_with("0x0380") // Display controller
            })
            .unwrap_or(false)
    }

    pub fn devices_root(&self) -> &Path {
        &self.devices_root
    }
}

/// Resource-pool name for a PCI model. Devices of the same model on the
/// same node share one pool, so a second claim lands in the existing
/// device-plugin session instead of creating another.
pub fn pci_resource_name(vendor_id: u16, device_id: u16) -> String {
    format!("{}.com/{:04x}", vendor_word(vendor_id), device_id)
}

fn describe_device(vendor_id: u16, device_id: u16) -> String {
    format!("{} device [{:04x}:{:04x}]", vendor_word(vendor_id), vendor_id, device_id)
}
