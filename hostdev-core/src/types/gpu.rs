//! SR-IOV GPU and mediated-vGPU records.
//!
//! Unlike claims these are self-contained: enablement is a property of
//! the device itself, so declared intent and observed status live on
//! one object.

use super::{ObjectMeta, StoredObject};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An SR-IOV capable physical GPU.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SriovGpuDevice {
    pub metadata: ObjectMeta,
    pub spec: SriovGpuDeviceSpec,
    pub status: SriovGpuDeviceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SriovGpuDeviceSpec {
    pub address: String,
    pub node_name: String,
    /// Declared intent: should virtual functions be enabled.
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SriovGpuDeviceStatus {
    /// Addresses of the virtual functions currently exposed, derived
    /// from sysfs after every toggle rather than trusted from the
    /// management command's exit code.
    pub vf_addresses: Vec<String>,
    /// Record names of the vGPU devices carved from the VFs.
    pub vgpu_devices: Vec<String>,
    pub vf_enabled: bool,
}

impl StoredObject for SriovGpuDevice {
    const KIND: &'static str = "sriovgpudevice";

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

/// Enablement state of a mediated vGPU instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VgpuState {
    #[default]
    Disabled,
    Enabled,
}

/// A device that can host one mediated vGPU instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VgpuDevice {
    pub metadata: ObjectMeta,
    pub spec: VgpuDeviceSpec,
    pub status: VgpuDeviceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VgpuDeviceSpec {
    pub address: String,
    pub node_name: String,
    pub enabled: bool,
    /// Display name of the requested instance type, e.g. "NVIDIA A40-2Q".
    /// Must be a key of `status.available_types`.
    pub vgpu_type_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VgpuDeviceStatus {
    pub vgpu_status: VgpuState,
    /// Identifier of the configured mediated instance, empty when disabled.
    pub uuid: String,
    /// Display name of the type actually configured on the host.
    pub configured_type_name: String,
    /// Display name -> sysfs type directory ("NVIDIA A40-2Q" -> "nvidia-556").
    pub available_types: HashMap<String, String>,
}

impl StoredObject for VgpuDevice {
    const KIND: &'static str = "vgpudevice";

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

/// Resource-pool name for a vGPU type ("NVIDIA A40-2Q" -> "nvidia.com/NVIDIA_A40-2Q").
pub fn vgpu_resource_name(type_name: &str) -> String {
    format!("nvidia.com/{}", type_name.replace(' ', "_"))
}
