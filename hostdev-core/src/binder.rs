//! Kernel driver binding via sysfs.
//!
//! Passthrough hands a device from its native driver to vfio-pci: tell
//! vfio-pci about the vendor/device pair through `new_id`, detach the
//! native driver through its `unbind` file, and the probe that follows
//! picks the device up. Every operation here is idempotent so the
//! reconcilers can re-run the whole sequence after a crash or reboot.

use crate::error::{HostdevError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const VFIO_PCI_DRIVER: &str = "vfio-pci";

/// Binds and unbinds PCI devices against kernel drivers.
#[derive(Debug, Clone)]
pub struct DriverBinder {
    drivers_root: PathBuf,
}

impl DriverBinder {
    pub fn new(drivers_root: impl Into<PathBuf>) -> Self {
        Self { drivers_root: drivers_root.into() }
    }

    /// Whether `address` is currently bound to `driver`.
    pub fn is_bound(&self, address: &str, driver: &str) -> bool {
        self.drivers_root.join(driver).join(address).exists()
    }

    /// Register a vendor/device pair with vfio-pci. The driver probes
    /// and claims any unbound matching device. Registering a pair the
    /// driver already knows is not an error.
    pub fn bind_to_vfio(&self, vendor_id: u16, device_id: u16) -> Result<()> {
        let new_id = self.drivers_root.join(VFIO_PCI_DRIVER).join("new_id");
        if !new_id.exists() {
            return Err(HostdevError::DriverNotPresent { driver: VFIO_PCI_DRIVER.to_string() });
        }

        let id_pair = format!("{:04x} {:04x}", vendor_id, device_id);
        match fs::write(&new_id, &id_pair) {
            Ok(()) => {
                info!(id = %id_pair, "registered device ID with vfio-pci");
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string().to_lowercase();
                // EEXIST: the pair is already registered. EBUSY: the
                // device is already claimed. Both mean the desired end
                // state already holds.
                if msg.contains("exist") || msg.contains("busy") {
                    debug!(id = %id_pair, "device ID already registered with vfio-pci");
                    Ok(())
                } else {
                    Err(HostdevError::io(new_id, e))
                }
            }
        }
    }

    /// Detach `address` from `driver`. A device that is not bound to
    /// that driver is left alone; detaching is only an error when the
    /// binding exists and the write fails.
    pub fn unbind(&self, address: &str, driver: &str) -> Result<()> {
        if driver.is_empty() || !self.is_bound(address, driver) {
            debug!(address = %address, driver = %driver, "not bound, nothing to unbind");
            return Ok(());
        }
        let unbind = self.drivers_root.join(driver).join("unbind");
        fs::write(&unbind, address).map_err(|e| HostdevError::io(&unbind, e))?;
        info!(address = %address, driver = %driver, "unbound device from driver");
        Ok(())
    }

    /// Load the vfio kernel modules. Failure is logged rather than
    /// fatal: on hosts with the modules built in, modprobe is absent or
    /// a no-op and binding still works.
    pub async fn load_passthrough_modules(&self) {
        for module in ["vfio-pci", "vfio_iommu_type1"] {
            let status = tokio::process::Command::new("modprobe").arg(module).status().await;
            match status {
                Ok(s) if s.success() => debug!(module = %module, "kernel module loaded"),
                Ok(s) => warn!(module = %module, status = %s, "modprobe failed"),
                Err(e) => warn!(module = %module, error = %e, "could not run modprobe"),
            }
        }
    }

    pub fn drivers_root(&self) -> &Path {
        &self.drivers_root
    }
}
