//! USB device and claim records.

use super::{ObjectMeta, StoredObject};
use serde::{Deserialize, Serialize};

/// A USB device observed on a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsbDevice {
    pub metadata: ObjectMeta,
    pub spec: UsbDeviceSpec,
    pub status: UsbDeviceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsbDeviceSpec {
    /// Resource-pool name this device is advertised under.
    pub resource_name: String,
    pub node_name: String,
    /// Host device node, e.g. "/dev/bus/usb/002/003".
    pub device_path: String,
    /// Address of the USB controller the device hangs off.
    pub pci_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsbDeviceStatus {
    /// Four-digit hex vendor ID, e.g. "0951".
    pub vendor_id: String,
    /// Four-digit hex product ID.
    pub product_id: String,
    pub description: String,
    /// True while a claim has the device advertised to the kubelet.
    pub enabled: bool,
}

impl UsbDevice {
    /// Bus and device number, derived from the trailing components of
    /// the device path. These are the coordinates the allocation env
    /// var carries ("2:3"), not the record name.
    pub fn bus_device_numbers(&self) -> Option<(u32, u32)> {
        let mut parts = self.spec.device_path.rsplit('/');
        let device = parts.next()?.parse().ok()?;
        let bus = parts.next()?.parse().ok()?;
        Some((bus, device))
    }
}

impl StoredObject for UsbDevice {
    const KIND: &'static str = "usbdevice";

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

/// Declared intent that a USB device should be passed through.
/// Named after the USB device record it owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsbDeviceClaim {
    pub metadata: ObjectMeta,
    pub spec: UsbDeviceClaimSpec,
    pub status: UsbDeviceClaimStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsbDeviceClaimSpec {
    /// Who claimed the device.
    pub user_name: String,
}

/// Filled by the reconciler from the owning device record; empty on a
/// freshly created claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsbDeviceClaimStatus {
    pub node_name: String,
    /// Controller address copied from the owning device record.
    pub pci_address: String,
}

impl StoredObject for UsbDeviceClaim {
    const KIND: &'static str = "usbdeviceclaim";

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
