//! End-to-end vGPU lifecycle.
//!
//! Runs the vGPU reconciler against an mdev bus snapshot in a tempdir
//! and a fake kubelet: enable a typed instance, reject an unknown type
//! before any host write, disable, and adopt out-of-band configuration.

mod common;

use common::FakeKubelet;
use hostdev_core::error::HostdevError;
use hostdev_core::inventory::GpuScanner;
use hostdev_core::mdev::MdevManager;
use hostdev_core::plugin::PluginRegistry;
use hostdev_core::reconcile::VgpuEngine;
use hostdev_core::store::{MemoryStore, ObjectStore};
use hostdev_core::types::{vgpu_resource_name, StoredObject, VgpuDevice, VgpuState};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

const NODE: &str = "node1";
const ADDRESS: &str = "0000:65:00.4";
const TYPE_DIR: &str = "nvidia-556";
const TYPE_NAME: &str = "NVIDIA A40-2Q";

struct Harness {
    root: TempDir,
    _kubelet: FakeKubelet,
    vgpus: Arc<MemoryStore<VgpuDevice>>,
    registry: Arc<PluginRegistry>,
    engine: VgpuEngine,
}

impl Harness {
    async fn new() -> Self {
        let root = TempDir::new().unwrap();
        let mdev_root = root.path().join("mdev_bus");
        let pci_root = root.path().join("devices");
        let plugin_dir = root.path().join("plugins");
        fs::create_dir_all(&mdev_root).unwrap();
        fs::create_dir_all(&pci_root).unwrap();
        fs::create_dir_all(&plugin_dir).unwrap();

        seed_mdev_type(&mdev_root, ADDRESS, TYPE_DIR, TYPE_NAME);
        seed_mdev_type(&mdev_root, ADDRESS, "nvidia-557", "NVIDIA A40-4Q");

        let kubelet = FakeKubelet::start(&plugin_dir).await;
        let vgpus = Arc::new(MemoryStore::new());
        let registry = Arc::new(PluginRegistry::new(&plugin_dir, &kubelet.socket_path));
        let engine = VgpuEngine::new(
            NODE,
            vgpus.clone(),
            GpuScanner::new(&pci_root, &mdev_root),
            MdevManager::new(&mdev_root),
            registry.clone(),
        );

        Self { root, _kubelet: kubelet, vgpus, registry, engine }
    }

    fn mdev_root(&self) -> PathBuf {
        self.root.path().join("mdev_bus")
    }

    fn type_path(&self, type_dir: &str) -> PathBuf {
        self.mdev_root().join(ADDRESS).join("mdev_supported_types").join(type_dir)
    }

    /// What the kernel would do after the create write: materialize the
    /// instance under the type's devices/ dir with a remove file.
    fn emulate_instance(&self, type_dir: &str, uuid: &str) {
        let instance = self.type_path(type_dir).join("devices").join(uuid);
        fs::create_dir_all(&instance).unwrap();
        std::os::unix::fs::symlink(self.type_path(type_dir), instance.join("mdev_type")).unwrap();

        let control = self.mdev_root().join(ADDRESS).join(uuid);
        fs::create_dir_all(&control).unwrap();
        fs::write(control.join("remove"), "").unwrap();
    }

    async fn synced_device(&self) -> VgpuDevice {
        self.engine.sync_devices().await.unwrap();
        self.vgpus.list(Some(NODE)).await.unwrap().remove(0)
    }
}

fn seed_mdev_type(mdev_root: &Path, address: &str, type_dir: &str, display: &str) {
    let type_path = mdev_root.join(address).join("mdev_supported_types").join(type_dir);
    fs::create_dir_all(&type_path).unwrap();
    fs::write(type_path.join("name"), format!("{}\n", display)).unwrap();
    fs::write(type_path.join("create"), "").unwrap();
    fs::create_dir_all(type_path.join("devices")).unwrap();
}

#[tokio::test]
async fn test_enable_creates_typed_instance() {
    let h = Harness::new().await;
    let device = h.synced_device().await;
    assert_eq!(device.status.available_types.len(), 2);

    let mut declared = device.clone();
    declared.spec.enabled = true;
    declared.spec.vgpu_type_name = TYPE_NAME.to_string();
    let declared = h.vgpus.update(declared).await.unwrap();

    h.engine.on_change(&declared).await.unwrap();

    // The UUID written into the create file is the one in status.
    let written = fs::read_to_string(h.type_path(TYPE_DIR).join("create")).unwrap();
    assert!(Uuid::parse_str(&written).is_ok());

    let device = h.vgpus.get(device.name()).await.unwrap();
    assert_eq!(device.status.vgpu_status, VgpuState::Enabled);
    assert_eq!(device.status.uuid, written);
    assert_eq!(device.status.configured_type_name, TYPE_NAME);

    // Advertised under the type's pool, keyed by UUID.
    assert!(h.registry.has_device(&vgpu_resource_name(TYPE_NAME), &written).await);
}

#[tokio::test]
async fn test_unknown_type_fails_before_any_host_write() {
    let h = Harness::new().await;
    let device = h.synced_device().await;

    let mut declared = device.clone();
    declared.spec.enabled = true;
    declared.spec.vgpu_type_name = "NVIDIA A40-8Q".to_string();
    let declared = h.vgpus.update(declared).await.unwrap();

    let err = h.engine.on_change(&declared).await.unwrap_err();
    assert!(matches!(err, HostdevError::TypeNotAvailable { .. }));

    // No create file was touched and status still says disabled.
    assert_eq!(fs::read_to_string(h.type_path(TYPE_DIR).join("create")).unwrap(), "");
    let device = h.vgpus.get(device.name()).await.unwrap();
    assert_eq!(device.status.vgpu_status, VgpuState::Disabled);
    assert!(device.status.uuid.is_empty());
}

#[tokio::test]
async fn test_disable_tears_down_instance_and_pool() {
    let h = Harness::new().await;
    let device = h.synced_device().await;

    let mut declared = device.clone();
    declared.spec.enabled = true;
    declared.spec.vgpu_type_name = TYPE_NAME.to_string();
    let declared = h.vgpus.update(declared).await.unwrap();
    h.engine.on_change(&declared).await.unwrap();

    let uuid = h.vgpus.get(device.name()).await.unwrap().status.uuid;
    h.emulate_instance(TYPE_DIR, &uuid);

    let mut declared = h.vgpus.get(device.name()).await.unwrap();
    declared.spec.enabled = false;
    let declared = h.vgpus.update(declared).await.unwrap();
    h.engine.on_change(&declared).await.unwrap();

    // Teardown order: instance removed, pool drained, status cleared.
    let remove = h.mdev_root().join(ADDRESS).join(&uuid).join("remove");
    assert_eq!(fs::read_to_string(remove).unwrap(), "1");
    assert!(!h.registry.has_plugin(&vgpu_resource_name(TYPE_NAME)).await);

    let device = h.vgpus.get(device.name()).await.unwrap();
    assert_eq!(device.status.vgpu_status, VgpuState::Disabled);
    assert!(device.status.uuid.is_empty());
    assert!(device.status.configured_type_name.is_empty());

    // A second disable pass finds nothing left to do.
    let declared = h.vgpus.get(device.name()).await.unwrap();
    h.engine.on_change(&declared).await.unwrap();
}

#[tokio::test]
async fn test_out_of_band_instance_is_adopted_when_undeclared() {
    let h = Harness::new().await;
    let device = h.synced_device().await;

    // Someone created an instance behind the agent's back and the
    // record declares nothing. Reality wins.
    let uuid = Uuid::new_v4().to_string();
    h.emulate_instance(TYPE_DIR, &uuid);

    let declared = h.vgpus.get(device.name()).await.unwrap();
    h.engine.on_change(&declared).await.unwrap();

    // Adoption lands in spec too: the record now declares the instance.
    let device = h.vgpus.get(device.name()).await.unwrap();
    assert!(device.spec.enabled);
    assert_eq!(device.spec.vgpu_type_name, TYPE_NAME);
    assert_eq!(device.status.vgpu_status, VgpuState::Enabled);
    assert_eq!(device.status.uuid, uuid);
    assert_eq!(device.status.configured_type_name, TYPE_NAME);
    assert!(h.registry.has_device(&vgpu_resource_name(TYPE_NAME), &uuid).await);

    // The adoption write itself triggers another reconcile pass; it
    // must converge on the instance, not tear it down.
    h.engine.on_change(&device).await.unwrap();

    let remove = h.mdev_root().join(ADDRESS).join(&uuid).join("remove");
    assert_eq!(fs::read_to_string(remove).unwrap(), "");
    let device = h.vgpus.get(device.name()).await.unwrap();
    assert_eq!(device.status.uuid, uuid);
    assert!(h.registry.has_device(&vgpu_resource_name(TYPE_NAME), &uuid).await);
}

#[tokio::test]
async fn test_enabled_plugin_pass_restores_sessions() {
    let h = Harness::new().await;
    let device = h.synced_device().await;

    let mut declared = device.clone();
    declared.spec.enabled = true;
    declared.spec.vgpu_type_name = TYPE_NAME.to_string();
    let declared = h.vgpus.update(declared).await.unwrap();
    h.engine.on_change(&declared).await.unwrap();
    let uuid = h.vgpus.get(device.name()).await.unwrap().status.uuid;

    // Sessions die with the process; the status-keyed pass brings the
    // advertisement back.
    h.registry.stop_all().await;
    assert!(!h.registry.has_plugin(&vgpu_resource_name(TYPE_NAME)).await);

    h.engine.reconcile_enabled_plugins().await.unwrap();
    assert!(h.registry.has_device(&vgpu_resource_name(TYPE_NAME), &uuid).await);
}
