//! PCI claim reconciliation.
//!
//! A claim declares that one PCI device should be handed to vfio-pci
//! and advertised to the kubelet. The handler sequence is: permit the
//! device's resource pool, record the displaced driver, rebind to
//! vfio-pci, and only then write `passthrough_enabled`. Removal walks
//! the same steps backwards.

use super::{retry_status_update, sync_records};
use crate::binder::{DriverBinder, VFIO_PCI_DRIVER};
use crate::error::Result;
use crate::inventory::PciScanner;
use crate::permitted::{vendor_selector, PciHostDeviceEntry, PermittedDeviceClient};
use crate::plugin::{PluginDevice, PluginRegistry};
use crate::store::ObjectStore;
use crate::types::{PciDevice, PciDeviceClaim, StoredObject};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PciClaimEngine {
    node_name: String,
    devices: Arc<dyn ObjectStore<PciDevice>>,
    claims: Arc<dyn ObjectStore<PciDeviceClaim>>,
    scanner: PciScanner,
    binder: DriverBinder,
    permitted: Arc<dyn PermittedDeviceClient>,
    registry: Arc<PluginRegistry>,
    dev_root: PathBuf,
}

impl PciClaimEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: impl Into<String>,
        devices: Arc<dyn ObjectStore<PciDevice>>,
        claims: Arc<dyn ObjectStore<PciDeviceClaim>>,
        scanner: PciScanner,
        binder: DriverBinder,
        permitted: Arc<dyn PermittedDeviceClient>,
        registry: Arc<PluginRegistry>,
        dev_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            devices,
            claims,
            scanner,
            binder,
            permitted,
            registry,
            dev_root: dev_root.into(),
        }
    }

    /// Refresh the stored PCI inventory from a host scan.
    pub async fn sync_devices(&self) -> Result<()> {
        let discovered = self.scanner.scan(&self.node_name)?;
        sync_records(self.devices.as_ref(), &self.node_name, discovered, |_stored, fresh| fresh)
            .await
    }

    /// Drive one claim to the enabled state.
    pub async fn on_claim_change(&self, claim: &PciDeviceClaim) -> Result<()> {
        if claim.spec.node_name != self.node_name {
            return Ok(());
        }
        let device = self.devices.get(claim.name()).await?;
        let resource_name = device.status.resource_name.clone();

        self.ensure_permitted(&device).await?;

        // Fast path for the re-delivered claim: binding held and pool
        // advertised means there is nothing left to do.
        if claim.status.passthrough_enabled
            && self.current_driver(&device) == VFIO_PCI_DRIVER
            && self.registry.has_device(&resource_name, &device.status.address).await
        {
            debug!(claim = claim.name(), "claim already reconciled");
            return Ok(());
        }

        self.attempt_enable(claim, &device).await?;
        self.advertise(&device, &resource_name).await?;

        // Keep the inventory record in step with the binding we made.
        let _ = retry_status_update(self.devices.as_ref(), device.name(), |d| {
            d.status.kernel_driver_in_use = VFIO_PCI_DRIVER.to_string();
        })
        .await;

        info!(claim = claim.name(), address = %device.status.address, "passthrough enabled");
        Ok(())
    }

    /// Release a deleted claim's device: withdraw it from the kubelet,
    /// drop the permitted entry when the pool emptied, and detach
    /// vfio-pci. The claim record is gone, so status updates land on
    /// the device only.
    pub async fn on_claim_remove(&self, claim: &PciDeviceClaim) -> Result<()> {
        if claim.spec.node_name != self.node_name {
            return Ok(());
        }
        let address = &claim.spec.address;
        let device = match self.devices.get(claim.name()).await {
            Ok(device) => Some(device),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let resource_name = device
            .as_ref()
            .map(|d| d.status.resource_name.clone())
            .unwrap_or_default();
        if !resource_name.is_empty() {
            let pool_gone = self.registry.remove_device(&resource_name, address).await;
            if pool_gone {
                let mut permitted = self.permitted.get().await?;
                if permitted.remove_pci(&resource_name) {
                    self.permitted.update(permitted).await?;
                }
            }
        }

        self.binder.unbind(address, VFIO_PCI_DRIVER)?;

        if let Some(device) = device {
            // The hardware record may have been deleted by a concurrent
            // rescan; that is fine, the next scan recreates it.
            let result = retry_status_update(self.devices.as_ref(), device.name(), |d| {
                d.status.kernel_driver_in_use =
                    self.scanner.current_driver(address).unwrap_or_default();
            })
            .await;
            if let Err(e) = result {
                if !e.is_not_found() {
                    return Err(e);
                }
            }
        }

        info!(claim = claim.name(), address = %address, "passthrough released");
        Ok(())
    }

    /// Re-run the enable sequence for every claim on this node; host
    /// truth decides which steps are still needed. After a reboot the
    /// devices are back on their default drivers, after a kubelet
    /// restart the plugin sessions are gone; either way the claims
    /// still say passthrough.
    pub async fn reconcile_claims(&self) -> Result<()> {
        for claim in self.claims.list(Some(&self.node_name)).await? {
            if let Err(e) = self.on_claim_change(&claim).await {
                warn!(claim = claim.name(), error = %e, "claim reconcile failed");
            }
        }
        Ok(())
    }

    /// Detach vfio-pci from devices no claim owns. Covers claims that
    /// were deleted while the agent was down.
    pub async fn unbind_orphaned(&self) -> Result<()> {
        for device in self.devices.list(Some(&self.node_name)).await? {
            if self.current_driver(&device) != VFIO_PCI_DRIVER {
                continue;
            }
            match self.claims.get(device.name()).await {
                Ok(_) => continue,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            info!(device = device.name(), address = %device.status.address, "unbinding orphaned device");
            self.binder.unbind(&device.status.address, VFIO_PCI_DRIVER)?;
            retry_status_update(self.devices.as_ref(), device.name(), |d| {
                d.status.kernel_driver_in_use.clear();
            })
            .await?;
        }
        Ok(())
    }

    async fn ensure_permitted(&self, device: &PciDevice) -> Result<()> {
        let mut permitted = self.permitted.get().await?;
        let changed = permitted.ensure_pci(PciHostDeviceEntry {
            resource_name: device.status.resource_name.clone(),
            vendor_selector: vendor_selector(device.status.vendor_id, device.status.device_id),
            external_resource_provider: true,
        });
        if changed {
            self.permitted.update(permitted).await?;
        }
        Ok(())
    }

    /// Hand the device to vfio-pci and record the outcome. The
    /// displaced driver is written to the claim before the unbind so a
    /// crash between the two steps loses nothing.
    async fn attempt_enable(&self, claim: &PciDeviceClaim, device: &PciDevice) -> Result<()> {
        let address = &device.status.address;
        let current = self.current_driver(device);

        if current != VFIO_PCI_DRIVER {
            if !current.is_empty() {
                retry_status_update(self.claims.as_ref(), claim.name(), |c| {
                    c.status.kernel_driver_to_unbind = current.clone();
                })
                .await?;
                self.binder.unbind(address, &current)?;
            }
            self.binder.bind_to_vfio(device.status.vendor_id, device.status.device_id)?;
        }

        retry_status_update(self.claims.as_ref(), claim.name(), |c| {
            c.status.passthrough_enabled = true;
        })
        .await?;
        Ok(())
    }

    async fn advertise(&self, device: &PciDevice, resource_name: &str) -> Result<()> {
        let mut device_paths = vec![format!("{}/vfio/vfio", self.dev_root.display())];
        if let Some(group) = &device.status.iommu_group {
            device_paths.push(format!("{}/vfio/{}", self.dev_root.display(), group));
        }
        self.registry
            .ensure_device(
                resource_name,
                "PCI_RESOURCE",
                PluginDevice {
                    id: device.status.address.clone(),
                    healthy: true,
                    device_paths,
                    env_value: None,
                },
            )
            .await
    }

    /// Live driver binding, preferring sysfs over the stored record.
    /// An absent driver link means unbound, not unknown; the stored
    /// value only covers a device dir that vanished mid-reconcile.
    fn current_driver(&self, device: &PciDevice) -> String {
        let address = &device.status.address;
        if self.scanner.devices_root().join(address).exists() {
            self.scanner.current_driver(address).unwrap_or_default()
        } else {
            device.status.kernel_driver_in_use.clone()
        }
    }
}
