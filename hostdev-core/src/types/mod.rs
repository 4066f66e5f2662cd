//! Record types for the devices hostdev manages.
//!
//! Every record splits into spec (declared intent) and status (observed
//! host truth), with a shared [`ObjectMeta`] carrying the name and the
//! optimistic-concurrency resource version the store checks on writes.

mod gpu;
mod pci;
mod usb;

pub use gpu::{SriovGpuDevice, SriovGpuDeviceSpec, SriovGpuDeviceStatus};
pub use gpu::{vgpu_resource_name, VgpuDevice, VgpuDeviceSpec, VgpuDeviceStatus, VgpuState};
pub use pci::{PciDevice, PciDeviceClaim, PciDeviceClaimSpec, PciDeviceClaimStatus, PciDeviceStatus};
pub use usb::{
    UsbDevice, UsbDeviceClaim, UsbDeviceClaimSpec, UsbDeviceClaimStatus, UsbDeviceSpec,
    UsbDeviceStatus,
};

use serde::{Deserialize, Serialize};

/// Common metadata for stored records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    /// Bumped by the store on every accepted write; a write carrying a
    /// stale version is rejected with a conflict.
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), resource_version: 0 }
    }
}

/// Implemented by every record the declarative store holds.
pub trait StoredObject: Clone + Send + Sync + 'static {
    /// Singular kind name used in errors ("pcidevice", "usbdeviceclaim", ...).
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
    /// Node affinity, used to filter a listing down to this agent's node.
    fn node_name(&self) -> &str;

    fn name(&self) -> &str {
        &self.metadata().name
    }
}

/// Well-known vendor IDs, mapped to the word used in record names.
pub fn vendor_word(vendor_id: u16) -> &'static str {
    match vendor_id {
        0x10de => "nvidia",
        0x1002 => "amd",
        0x8086 => "intel",
        0x15b3 => "mellanox",
        0x14e4 => "broadcom",
        0x10ec => "realtek",
        _ => "dev",
    }
}

/// Strip the punctuation out of a bus address so it can be used in a
/// DNS-safe record name ("0000:3b:00.0" -> "00003b000").
pub fn dns_safe_address(address: &str) -> String {
    address.replace([':', '.'], "")
}

/// Deterministic record name for a physical device on a node.
///
/// Derived from node name, vendor, device ID and address so re-scans
/// produce the same name for the same hardware and never duplicate
/// records.
pub fn device_record_name(node_name: &str, vendor_id: u16, device_id: u16, address: &str) -> String {
    format!(
        "{}-{}-{:x}-{:x}-{}",
        node_name,
        vendor_word(vendor_id),
        vendor_id,
        device_id,
        dns_safe_address(address)
    )
}
