//! hostdev core library
//!
//! Device discovery, claim reconciliation, and kubelet device-plugin
//! sessions for the per-node passthrough agent.

pub mod binder;
pub mod config;
pub mod error;
pub mod exec;
pub mod inventory;
pub mod mdev;
pub mod observability;
pub mod permitted;
pub mod plugin;
pub mod reconcile;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use binder::{DriverBinder, VFIO_PCI_DRIVER};
pub use config::AgentConfig;
pub use error::{HostdevError, Result};
pub use exec::{CommandExecutor, LocalExecutor, RemoteExecutor};
pub use inventory::{GpuScanner, PciScanner, UsbScanner};
pub use mdev::MdevManager;
pub use observability::init as init_observability;
pub use permitted::{MemoryPermittedDevices, PermittedDeviceClient, PermittedHostDevices};
pub use plugin::{DevicePlugin, PluginRegistry};
pub use reconcile::{PciClaimEngine, SriovGpuEngine, UsbClaimEngine, VgpuEngine};
pub use store::{MemoryStore, ObjectStore, WatchEvent};
pub use types::{
    PciDevice, PciDeviceClaim, SriovGpuDevice, UsbDevice, UsbDeviceClaim, VgpuDevice, VgpuState,
};
