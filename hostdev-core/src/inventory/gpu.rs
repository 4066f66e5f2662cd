//! SR-IOV GPU and mediated-device scanner.

use super::{read_link_basename, read_sysfs_hex, read_sysfs_value};
use crate::error::Result;
use crate::types::{
    device_record_name, ObjectMeta, SriovGpuDevice, SriovGpuDeviceSpec, SriovGpuDeviceStatus,
    VgpuDevice, VgpuDeviceSpec, VgpuDeviceStatus, VgpuState,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Observed state of one mediated vGPU slot, read straight from sysfs.
#[derive(Debug, Clone, Default)]
pub struct VgpuHostState {
    /// UUID of the configured instance, if one exists.
    pub uuid: Option<String>,
    /// Sysfs type directory of the configured instance ("nvidia-556").
    pub configured_type_dir: Option<String>,
    /// Display name -> sysfs type directory for every creatable type.
    pub available_types: HashMap<String, String>,
}

/// Discovers SR-IOV capable GPUs and vGPU-capable functions.
#[derive(Debug, Clone)]
pub struct GpuScanner {
    pci_devices_root: PathBuf,
    mdev_bus_root: PathBuf,
}

impl GpuScanner {
    pub fn new(pci_devices_root: impl Into<PathBuf>, mdev_bus_root: impl Into<PathBuf>) -> Self {
        Self {
            pci_devices_root: pci_devices_root.into(),
            mdev_bus_root: mdev_bus_root.into(),
        }
    }

    /// Physical GPUs advertising SR-IOV capability. A device qualifies
    /// when its sysfs dir carries `sriov_totalvfs` with a nonzero count.
    pub fn identify_sriov_gpus(&self, node_name: &str) -> Result<Vec<SriovGpuDevice>> {
        let mut gpus = Vec::new();
        let entries = fs::read_dir(&self.pci_devices_root)
            .map_err(|e| crate::error::HostdevError::io(&self.pci_devices_root, e))?;

        for entry in entries.flatten() {
            let address = entry.file_name().to_string_lossy().to_string();
            if !super::pci::is_valid_pci_address(&address) {
                continue;
            }
            let totalvfs_path = entry.path().join("sriov_totalvfs");
            if !totalvfs_path.exists() {
                continue;
            }
            let total: u32 = match read_sysfs_value(&totalvfs_path).map(|v| v.parse()) {
                Ok(Ok(n)) => n,
                _ => continue,
            };
            if total == 0 {
                continue;
            }

            match self.read_sriov_gpu(&address, node_name) {
                Ok(gpu) => gpus.push(gpu),
                Err(e) => warn!(address = %address, error = %e, "skipping unreadable SR-IOV GPU"),
            }
        }

        debug!(count = gpus.len(), "SR-IOV GPU scan complete");
        Ok(gpus)
    }

    fn read_sriov_gpu(&self, address: &str, node_name: &str) -> Result<SriovGpuDevice> {
        let device_path = self.pci_devices_root.join(address);
        let vendor_id = read_sysfs_hex(&device_path.join("vendor"))?;
        let device_id = read_sysfs_hex(&device_path.join("device"))?;
        let vf_addresses = self.vf_addresses(address);
        // VFs carved before the agent ever saw this GPU are adopted as
        // declared state, not torn down as drift.
        let vf_enabled = !vf_addresses.is_empty();

        Ok(SriovGpuDevice {
            metadata: ObjectMeta::named(device_record_name(node_name, vendor_id, device_id, address)),
            spec: SriovGpuDeviceSpec {
                address: address.to_string(),
                node_name: node_name.to_string(),
                enabled: vf_enabled,
            },
            status: SriovGpuDeviceStatus {
                vf_enabled,
                vf_addresses,
                vgpu_devices: Vec::new(),
            },
        })
    }

    /// Addresses of the virtual functions currently carved from a
    /// physical function, resolved from its `virtfn*` symlinks.
    pub fn vf_addresses(&self, address: &str) -> Vec<String> {
        let device_path = self.pci_devices_root.join(address);
        let Ok(entries) = fs::read_dir(&device_path) else {
            return Vec::new();
        };
        let mut addresses: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("virtfn"))
            .filter_map(|e| read_link_basename(&e.path()))
            .collect();
        addresses.sort();
        addresses
    }

    /// Functions able to host a mediated vGPU instance. A function
    /// qualifies when it appears on the mdev bus with a populated
    /// `mdev_supported_types` directory.
    pub fn identify_vgpu_devices(&self, node_name: &str) -> Result<Vec<VgpuDevice>> {
        let mut devices = Vec::new();
        if !self.mdev_bus_root.exists() {
            return Ok(devices);
        }
        let entries = fs::read_dir(&self.mdev_bus_root)
            .map_err(|e| crate::error::HostdevError::io(&self.mdev_bus_root, e))?;

        for entry in entries.flatten() {
            let address = entry.file_name().to_string_lossy().to_string();
            if !super::pci::is_valid_pci_address(&address) {
                continue;
            }
            match self.read_vgpu_device(&address, node_name) {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(e) => warn!(address = %address, error = %e, "skipping unreadable vGPU function"),
            }
        }

        debug!(count = devices.len(), "vGPU scan complete");
        Ok(devices)
    }

    fn read_vgpu_device(&self, address: &str, node_name: &str) -> Result<Option<VgpuDevice>> {
        let host = self.fetch_vgpu_status(address)?;
        if host.available_types.is_empty() {
            return Ok(None);
        }

        let pci_path = self.pci_devices_root.join(address);
        let vendor_id = read_sysfs_hex(&pci_path.join("vendor")).unwrap_or(0x10de);
        let device_id = read_sysfs_hex(&pci_path.join("device")).unwrap_or_default();

        let configured_type_name = host
            .configured_type_dir
            .as_deref()
            .and_then(|dir| {
                host.available_types
                    .iter()
                    .find(|(_, type_dir)| type_dir.as_str() == dir)
                    .map(|(name, _)| name.clone())
            })
            .unwrap_or_default();

        Ok(Some(VgpuDevice {
            metadata: ObjectMeta::named(device_record_name(node_name, vendor_id, device_id, address)),
            spec: VgpuDeviceSpec {
                address: address.to_string(),
                node_name: node_name.to_string(),
                enabled: false,
                vgpu_type_name: String::new(),
            },
            status: VgpuDeviceStatus {
                vgpu_status: if host.uuid.is_some() {
                    VgpuState::Enabled
                } else {
                    VgpuState::Disabled
                },
                uuid: host.uuid.unwrap_or_default(),
                configured_type_name,
                available_types: host.available_types,
            },
        }))
    }

    /// Read the live mdev state of one function: its creatable types and
    /// the configured instance, if any.
    pub fn fetch_vgpu_status(&self, address: &str) -> Result<VgpuHostState> {
        let types_root = self.mdev_bus_root.join(address).join("mdev_supported_types");
        let mut state = VgpuHostState::default();
        if !types_root.exists() {
            return Ok(state);
        }

        let entries =
            fs::read_dir(&types_root).map_err(|e| crate::error::HostdevError::io(&types_root, e))?;
        for entry in entries.flatten() {
            let type_dir = entry.file_name().to_string_lossy().to_string();
            let display_name = match read_sysfs_value(&entry.path().join("name")) {
                Ok(name) if !name.is_empty() => name,
                _ => type_dir.clone(),
            };
            state.available_types.insert(display_name, type_dir.clone());

            if let Some((uuid, configured)) = configured_instance(&entry.path(), &type_dir) {
                state.uuid = Some(uuid);
                state.configured_type_dir = Some(configured);
            }
        }

        Ok(state)
    }
}

/// Look inside one type directory's `devices/` for a configured
/// instance. The entry name is the instance UUID; its `mdev_type` link
/// points back at the owning type directory.
fn configured_instance(type_path: &Path, type_dir: &str) -> Option<(String, String)> {
    let devices = type_path.join("devices");
    let entries = fs::read_dir(&devices).ok()?;
    for entry in entries.flatten() {
        let uuid = entry.file_name().to_string_lossy().to_string();
        let linked = read_link_basename(&entry.path().join("mdev_type"))
            .unwrap_or_else(|| type_dir.to_string());
        return Some((uuid, linked));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn seed_pci_gpu(root: &Path, address: &str, totalvfs: &str) {
        let dev = root.join(address);
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("vendor"), "0x10de\n").unwrap();
        fs::write(dev.join("device"), "0x2235\n").unwrap();
        fs::write(dev.join("sriov_totalvfs"), format!("{}\n", totalvfs)).unwrap();
    }

    #[test]
    fn test_identify_sriov_gpus() {
        let root = tempfile::tempdir().unwrap();
        seed_pci_gpu(root.path(), "0000:65:00.0", "16");
        seed_pci_gpu(root.path(), "0000:66:00.0", "0"); // capability off

        // One VF already carved.
        let vf = root.path().join("0000:65:00.4");
        fs::create_dir_all(&vf).unwrap();
        symlink(&vf, root.path().join("0000:65:00.0").join("virtfn0")).unwrap();

        let scanner = GpuScanner::new(root.path(), root.path().join("mdev_bus"));
        let gpus = scanner.identify_sriov_gpus("node1").unwrap();
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].spec.address, "0000:65:00.0");
        assert!(gpus[0].spec.enabled, "carved VFs should land in spec as declared state");
        assert!(gpus[0].status.vf_enabled);
        assert_eq!(gpus[0].status.vf_addresses, vec!["0000:65:00.4"]);
    }

    fn seed_mdev_type(mdev_root: &Path, address: &str, type_dir: &str, display: &str) -> PathBuf {
        let type_path = mdev_root.join(address).join("mdev_supported_types").join(type_dir);
        fs::create_dir_all(&type_path).unwrap();
        fs::write(type_path.join("name"), format!("{}\n", display)).unwrap();
        fs::create_dir_all(type_path.join("devices")).unwrap();
        type_path
    }

    #[test]
    fn test_identify_vgpu_devices_unconfigured() {
        let root = tempfile::tempdir().unwrap();
        let mdev_root = root.path().join("mdev_bus");
        seed_mdev_type(&mdev_root, "0000:65:00.4", "nvidia-556", "NVIDIA A40-2Q");

        let scanner = GpuScanner::new(root.path(), &mdev_root);
        let devices = scanner.identify_vgpu_devices("node1").unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].status.vgpu_status, VgpuState::Disabled);
        assert_eq!(
            devices[0].status.available_types.get("NVIDIA A40-2Q"),
            Some(&"nvidia-556".to_string())
        );
    }

    #[test]
    fn test_fetch_vgpu_status_finds_configured_instance() {
        let root = tempfile::tempdir().unwrap();
        let mdev_root = root.path().join("mdev_bus");
        let type_path = seed_mdev_type(&mdev_root, "0000:65:00.4", "nvidia-556", "NVIDIA A40-2Q");
        seed_mdev_type(&mdev_root, "0000:65:00.4", "nvidia-557", "NVIDIA A40-4Q");

        let uuid = "c73f1fa6-489e-4834-9476-d70dabd98c40";
        let instance = type_path.join("devices").join(uuid);
        fs::create_dir_all(&instance).unwrap();
        symlink(&type_path, instance.join("mdev_type")).unwrap();

        let scanner = GpuScanner::new(root.path(), &mdev_root);
        let state = scanner.fetch_vgpu_status("0000:65:00.4").unwrap();
        assert_eq!(state.uuid.as_deref(), Some(uuid));
        assert_eq!(state.configured_type_dir.as_deref(), Some("nvidia-556"));
        assert_eq!(state.available_types.len(), 2);

        let devices = scanner.identify_vgpu_devices("node1").unwrap();
        assert_eq!(devices[0].status.vgpu_status, VgpuState::Enabled);
        assert_eq!(devices[0].status.configured_type_name, "NVIDIA A40-2Q");
    }
}
