//! USB bus scanner.

use super::read_sysfs_value;
use crate::error::Result;
use crate::types::{ObjectMeta, UsbDevice, UsbDeviceSpec, UsbDeviceStatus};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Reads `/sys/bus/usb/devices` and produces one record per attached
/// device. Interface entries (names containing ':') and root hubs are
/// skipped.
#[derive(Debug, Clone)]
pub struct UsbScanner {
    devices_root: PathBuf,
    dev_root: PathBuf,
}

impl UsbScanner {
    pub fn new(devices_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self { devices_root: devices_root.into(), dev_root: dev_root.into() }
    }

    pub fn scan(&self, node_name: &str) -> Result<Vec<UsbDevice>> {
        let mut devices = Vec::new();
        let entries = fs::read_dir(&self.devices_root)
            .map_err(|e| crate::error::HostdevError::io(&self.devices_root, e))?;

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            // "2-1.4:1.0" is an interface of "2-1.4"; only whole devices
            // get records. Root hubs appear as "usb1", "usb2", ...
            if name.contains(':') || name.starts_with("usb") {
                continue;
            }
            match self.read_device(&name, node_name) {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(e) => warn!(entry = %name, error = %e, "skipping unreadable USB device"),
            }
        }

        debug!(count = devices.len(), "USB scan complete");
        Ok(devices)
    }

    fn read_device(&self, entry: &str, node_name: &str) -> Result<Option<UsbDevice>> {
        let path = self.devices_root.join(entry);
        if !path.join("idVendor").exists() {
            // Hubs and ports without a full device description.
            return Ok(None);
        }

        let vendor_id = read_sysfs_value(&path.join("idVendor"))?;
        let product_id = read_sysfs_value(&path.join("idProduct"))?;
        let busnum = read_sysfs_value(&path.join("busnum"))?;
        let devnum = read_sysfs_value(&path.join("devnum"))?;
        let description = read_sysfs_value(&path.join("product")).unwrap_or_default();
        let pci_address = self.controller_address(entry);

        let bus: u32 = busnum
            .parse()
            .map_err(|e| crate::error::HostdevError::Internal(format!("bad busnum {:?}: {}", busnum, e)))?;
        let dev: u32 = devnum
            .parse()
            .map_err(|e| crate::error::HostdevError::Internal(format!("bad devnum {:?}: {}", devnum, e)))?;
        let device_path =
            format!("{}/bus/usb/{:03}/{:03}", self.dev_root.display(), bus, dev);

        let name = format!("{}-{}-{}-{}{}", node_name, vendor_id, product_id, busnum, devnum);
        Ok(Some(UsbDevice {
            metadata: ObjectMeta::named(name),
            spec: UsbDeviceSpec {
                resource_name: usb_resource_name(&vendor_id, &product_id),
                node_name: node_name.to_string(),
                device_path,
                pci_address,
            },
            status: UsbDeviceStatus {
                vendor_id,
                product_id,
                description,
                enabled: false,
            },
        }))
    }

    /// Walk the sysfs parent chain to the PCI controller the device
    /// hangs off. The device dir is a symlink into the PCI tree, so the
    /// resolved path contains the controller address.
    fn controller_address(&self, entry: &str) -> String {
        let path = self.devices_root.join(entry);
        let Ok(resolved) = fs::canonicalize(&path) else {
            return String::new();
        };
        for component in resolved.components() {
            let part = component.as_os_str().to_string_lossy();
            if super::pci::is_valid_pci_address(&part) {
                return part.to_string();
            }
        }
        String::new()
    }
}

/// Resource-pool name for a USB model ("kubevirt.io/0951-1666").
pub fn usb_resource_name(vendor_id: &str, product_id: &str) -> String {
    format!("kubevirt.io/{}-{}", vendor_id, product_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_device(root: &std::path::Path, entry: &str, vendor: &str, product: &str) {
        let dev = root.join(entry);
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("idVendor"), format!("{}\n", vendor)).unwrap();
        fs::write(dev.join("idProduct"), format!("{}\n", product)).unwrap();
        fs::write(dev.join("busnum"), "2\n").unwrap();
        fs::write(dev.join("devnum"), "3\n").unwrap();
        fs::write(dev.join("product"), "DataTraveler\n").unwrap();
    }

    #[test]
    fn test_scan_skips_interfaces_and_hubs() {
        let root = tempfile::tempdir().unwrap();
        seed_device(root.path(), "2-1.4", "0951", "1666");
        fs::create_dir_all(root.path().join("2-1.4:1.0")).unwrap();
        fs::create_dir_all(root.path().join("usb2")).unwrap();

        let scanner = UsbScanner::new(root.path(), "/dev");
        let devices = scanner.scan("node1").unwrap();
        assert_eq!(devices.len(), 1);

        let dev = &devices[0];
        assert_eq!(dev.status.vendor_id, "0951");
        assert_eq!(dev.status.product_id, "1666");
        assert_eq!(dev.spec.device_path, "/dev/bus/usb/002/003");
        assert_eq!(dev.spec.resource_name, "kubevirt.io/0951-1666");
        assert_eq!(dev.status.description, "DataTraveler");
        assert!(!dev.status.enabled);
    }

    #[test]
    fn test_entry_without_vendor_file_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("2-0:1.0")).unwrap();
        fs::create_dir_all(root.path().join("2-1")).unwrap(); // port, no idVendor

        let scanner = UsbScanner::new(root.path(), "/dev");
        assert!(scanner.scan("node1").unwrap().is_empty());
    }
}
