//! Host inventory scanners.
//!
//! Pure sysfs readers, no side effects. Each scanner is rooted at a
//! configurable path so tests can point it at a snapshot tree.

mod gpu;
mod pci;
mod usb;

pub use gpu::{GpuScanner, VgpuHostState};
pub use pci::{is_valid_pci_address, pci_resource_name, PciScanner};
pub use usb::{usb_resource_name, UsbScanner};

use crate::error::{HostdevError, Result};
use std::fs;
use std::path::Path;

/// Read and trim a sysfs attribute file.
pub(crate) fn read_sysfs_value(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| HostdevError::io(path, e))
}

/// Parse a sysfs hex attribute like "0x10de".
pub(crate) fn read_sysfs_hex(path: &Path) -> Result<u16> {
    let raw = read_sysfs_value(path)?;
    u16::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| HostdevError::Internal(format!("bad hex value in {:?}: {}", path, e)))
}

/// Resolve the basename of a sysfs symlink, e.g. the `driver` link.
pub(crate) fn read_link_basename(path: &Path) -> Option<String> {
    if !path.exists() {
        return None;
    }
    fs::read_link(path)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
}
