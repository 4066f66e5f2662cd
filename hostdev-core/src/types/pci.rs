//! PCI device and claim records.

use super::{ObjectMeta, StoredObject};
use serde::{Deserialize, Serialize};

/// A physical PCI device observed on a node.
///
/// Pure observation: everything lives in status, refreshed from the
/// host inventory scan. One record per physical address per node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PciDevice {
    pub metadata: ObjectMeta,
    pub status: PciDeviceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PciDeviceStatus {
    /// Bus address, e.g. "0000:3b:00.0".
    pub address: String,
    pub vendor_id: u16,
    pub device_id: u16,
    pub node_name: String,
    /// Human-readable description derived from vendor/device IDs.
    pub description: String,
    /// Kernel driver currently bound, empty if unbound.
    pub kernel_driver_in_use: String,
    /// Resource-pool name this device is advertised under when claimed.
    pub resource_name: String,
    /// IOMMU group number, if the platform assigned one.
    pub iommu_group: Option<String>,
}

impl StoredObject for PciDevice {
    const KIND: &'static str = "pcidevice";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn node_name(&self) -> &str {
        &self.status.node_name
    }
}

/// Declared intent that a PCI device should be passed through.
///
/// A claim's name equals the name of the device record it owns, so
/// deleting the claim releases exactly that device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PciDeviceClaim {
    pub metadata: ObjectMeta,
    pub spec: PciDeviceClaimSpec,
    pub status: PciDeviceClaimStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PciDeviceClaimSpec {
    pub address: String,
    pub node_name: String,
    /// Who asked for the passthrough, informational.
    pub user_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PciDeviceClaimStatus {
    /// Driver that was displaced when passthrough was enabled, kept so
    /// operators know what the device ran before.
    pub kernel_driver_to_unbind: String,
    /// Observed binding outcome; only set after the bind succeeded.
    pub passthrough_enabled: bool,
}

impl StoredObject for PciDeviceClaim {
    const KIND: &'static str = "pcideviceclaim";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn node_name(&self) -> &str {
        &self.spec.node_name
    }
}
