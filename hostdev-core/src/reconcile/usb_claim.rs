//! USB claim reconciliation.
//!
//! USB passthrough needs no driver surgery: the handler permits the
//! device's pool, advertises the device node to the kubelet, and marks
//! the device record enabled. Removal withdraws in the same order.
//!
//! A fresh claim carries nothing but its name; which node it belongs
//! to comes from the owning device record, and the handler writes the
//! resolved node and controller address back into the claim's status.

use super::{retry_status_update, sync_records};
use crate::error::Result;
use crate::inventory::UsbScanner;
use crate::permitted::{PermittedDeviceClient, UsbHostDeviceEntry};
use crate::plugin::{PluginDevice, PluginRegistry};
use crate::store::ObjectStore;
use crate::types::{StoredObject, UsbDevice, UsbDeviceClaim};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct UsbClaimEngine {
    node_name: String,
    devices: Arc<dyn ObjectStore<UsbDevice>>,
    claims: Arc<dyn ObjectStore<UsbDeviceClaim>>,
    scanner: UsbScanner,
    permitted: Arc<dyn PermittedDeviceClient>,
    registry: Arc<PluginRegistry>,
}

impl UsbClaimEngine {
    pub fn new(
        node_name: impl Into<String>,
        devices: Arc<dyn ObjectStore<UsbDevice>>,
        claims: Arc<dyn ObjectStore<UsbDeviceClaim>>,
        scanner: UsbScanner,
        permitted: Arc<dyn PermittedDeviceClient>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            devices,
            claims,
            scanner,
            permitted,
            registry,
        }
    }

    /// Refresh the stored USB inventory from a host scan. The enabled
    /// flag is reconcile state, not an observation, so it survives the
    /// refresh.
    pub async fn sync_devices(&self) -> Result<()> {
        let discovered = self.scanner.scan(&self.node_name)?;
        sync_records(self.devices.as_ref(), &self.node_name, discovered, |stored, mut fresh| {
            fresh.status.enabled = stored.status.enabled;
            fresh
        })
        .await
    }

    pub async fn on_claim_change(&self, claim: &UsbDeviceClaim) -> Result<()> {
        // The claim names the device record; the record says which node
        // owns it.
        let device = self.devices.get(claim.name()).await?;
        if device.spec.node_name != self.node_name {
            return Ok(());
        }
        let resource_name = device.spec.resource_name.clone();

        if claim.status.node_name != device.spec.node_name
            || claim.status.pci_address != device.spec.pci_address
        {
            retry_status_update(self.claims.as_ref(), claim.name(), |c| {
                c.status.node_name = device.spec.node_name.clone();
                c.status.pci_address = device.spec.pci_address.clone();
            })
            .await?;
        }

        // The permitted entry is upserted rather than appended: if the
        // stick behind a pool name was swapped, the vendor/product
        // selector changes in place.
        let mut permitted = self.permitted.get().await?;
        let changed = permitted.upsert_usb(UsbHostDeviceEntry {
            resource_name: resource_name.clone(),
            vendor: device.status.vendor_id.clone(),
            product: device.status.product_id.clone(),
            external_resource_provider: true,
        });
        if changed {
            self.permitted.update(permitted).await?;
        }

        self.registry
            .ensure_device(
                &resource_name,
                "USB_RESOURCE",
                PluginDevice {
                    id: device.name().to_string(),
                    healthy: true,
                    device_paths: vec![device.spec.device_path.clone()],
                    env_value: device
                        .bus_device_numbers()
                        .map(|(bus, dev)| format!("{}:{}", bus, dev)),
                },
            )
            .await?;

        if !device.status.enabled {
            retry_status_update(self.devices.as_ref(), device.name(), |d| {
                d.status.enabled = true;
            })
            .await?;
        }

        info!(claim = claim.name(), path = %device.spec.device_path, "USB passthrough enabled");
        Ok(())
    }

    pub async fn on_claim_remove(&self, claim: &UsbDeviceClaim) -> Result<()> {
        let device = match self.devices.get(claim.name()).await {
            Ok(device) => Some(device),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        // With the device record gone the claim's own status is the
        // only record of which node handled it.
        let node = device
            .as_ref()
            .map(|d| d.spec.node_name.as_str())
            .unwrap_or(claim.status.node_name.as_str());
        if node != self.node_name {
            return Ok(());
        }
        let Some(device) = device else {
            debug!(claim = claim.name(), "device record already gone");
            return Ok(());
        };
        let resource_name = device.spec.resource_name.clone();

        let pool_gone = self.registry.remove_device(&resource_name, device.name()).await;
        if pool_gone {
            let mut permitted = self.permitted.get().await?;
            if permitted.remove_usb(&resource_name) {
                self.permitted.update(permitted).await?;
            }
        }

        if device.status.enabled {
            let result = retry_status_update(self.devices.as_ref(), device.name(), |d| {
                d.status.enabled = false;
            })
            .await;
            if let Err(e) = result {
                if !e.is_not_found() {
                    return Err(e);
                }
            }
        }

        info!(claim = claim.name(), "USB passthrough released");
        Ok(())
    }

    /// Re-run every claim against host truth. Covers claims handled
    /// while the agent was down and plugin sessions lost to a kubelet
    /// restart.
    pub async fn reconcile_claims(&self) -> Result<()> {
        for claim in self.claims.list(None).await? {
            if let Err(e) = self.on_claim_change(&claim).await {
                warn!(claim = claim.name(), error = %e, "USB claim reconcile failed");
            }
        }
        Ok(())
    }
}
