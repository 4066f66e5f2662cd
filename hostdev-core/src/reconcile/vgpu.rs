//! vGPU reconciliation.
//!
//! Enabling validates the requested type against the function's
//! available types before any sysfs write, creates the mediated
//! instance, and advertises its UUID to the kubelet. Disabling runs the
//! same steps backwards: instance first, plugin second, status cleared
//! last, so a crash mid-teardown leaves enough state to finish the job
//! on the next pass.

use super::{retry_status_update, retry_update, sync_records};
use crate::error::{HostdevError, Result};
use crate::inventory::{GpuScanner, VgpuHostState};
use crate::mdev::MdevManager;
use crate::plugin::{PluginDevice, PluginRegistry};
use crate::store::ObjectStore;
use crate::types::{vgpu_resource_name, StoredObject, VgpuDevice, VgpuState};
use std::sync::Arc;
use tracing::{info, warn};

pub struct VgpuEngine {
    node_name: String,
    vgpus: Arc<dyn ObjectStore<VgpuDevice>>,
    scanner: GpuScanner,
    mdev: MdevManager,
    registry: Arc<PluginRegistry>,
}

impl VgpuEngine {
    pub fn new(
        node_name: impl Into<String>,
        vgpus: Arc<dyn ObjectStore<VgpuDevice>>,
        scanner: GpuScanner,
        mdev: MdevManager,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            vgpus,
            scanner,
            mdev,
            registry,
        }
    }

    /// Refresh the stored vGPU inventory. Spec is declared intent and
    /// survives; of the status only the available-types map is a pure
    /// observation, the rest is owned by the reconcile handlers.
    pub async fn sync_devices(&self) -> Result<()> {
        let discovered = self.scanner.identify_vgpu_devices(&self.node_name)?;
        sync_records(self.vgpus.as_ref(), &self.node_name, discovered, |stored, fresh| {
            let mut merged = stored.clone();
            merged.status.available_types = fresh.status.available_types;
            merged
        })
        .await
    }

    pub async fn on_change(&self, device: &VgpuDevice) -> Result<()> {
        if device.spec.node_name != self.node_name {
            return Ok(());
        }
        if device.spec.enabled {
            self.enable(device).await
        } else {
            self.disable(device).await
        }
    }

    /// A deleted record with a live instance still tears the instance
    /// down; otherwise the mdev would leak until the next reboot.
    pub async fn on_remove(&self, device: &VgpuDevice) -> Result<()> {
        if device.spec.node_name != self.node_name {
            return Ok(());
        }
        if device.status.uuid.is_empty() {
            return Ok(());
        }
        self.teardown_instance(device).await
    }

    async fn enable(&self, device: &VgpuDevice) -> Result<()> {
        let address = &device.spec.address;
        let requested = &device.spec.vgpu_type_name;
        let host = self.scanner.fetch_vgpu_status(address)?;

        // Validation gates every host mutation: an unknown type must
        // fail before anything is written.
        let Some(type_dir) = host.available_types.get(requested) else {
            return Err(HostdevError::TypeNotAvailable {
                type_name: requested.clone(),
                address: address.clone(),
            });
        };

        let uuid = match (&host.uuid, &host.configured_type_dir) {
            (Some(uuid), Some(configured)) if configured == type_dir => {
                // Instance of the right type already exists (agent
                // restart, or configured out of band); adopt it.
                uuid.clone()
            }
            (Some(uuid), _) => {
                // Wrong type configured; replace the instance.
                info!(address = %address, uuid = %uuid, "replacing mdev instance of different type");
                self.mdev.remove_instance(address, uuid)?;
                self.mdev.create_instance(address, type_dir)?
            }
            (None, _) => self.mdev.create_instance(address, type_dir)?,
        };

        retry_status_update(self.vgpus.as_ref(), device.name(), |d| {
            d.status.vgpu_status = VgpuState::Enabled;
            d.status.uuid = uuid.clone();
            d.status.configured_type_name = requested.clone();
        })
        .await?;

        self.registry
            .ensure_device(
                &vgpu_resource_name(requested),
                "VGPU_RESOURCE",
                PluginDevice {
                    id: uuid.clone(),
                    healthy: true,
                    device_paths: Vec::new(),
                    env_value: None,
                },
            )
            .await?;

        info!(device = device.name(), uuid = %uuid, r#type = %requested, "vGPU enabled");
        Ok(())
    }

    async fn disable(&self, device: &VgpuDevice) -> Result<()> {
        let host = self.scanner.fetch_vgpu_status(&device.spec.address)?;

        if let Some(uuid) = &host.uuid {
            // An instance exists that the record never asked for. With
            // no declared type this is out-of-band configuration worth
            // keeping: surface it in status and advertise it. With a
            // declared type the operator disabled the device; converge.
            if device.spec.vgpu_type_name.is_empty() && device.status.uuid.is_empty() {
                return self.adopt(device, &host, uuid.clone()).await;
            }
        }

        if device.status.uuid.is_empty() && host.uuid.is_none() {
            if device.status.vgpu_status != VgpuState::Disabled {
                retry_status_update(self.vgpus.as_ref(), device.name(), |d| {
                    d.status.vgpu_status = VgpuState::Disabled;
                })
                .await?;
            }
            return Ok(());
        }

        self.teardown_instance(device).await?;
        retry_status_update(self.vgpus.as_ref(), device.name(), |d| {
            d.status.vgpu_status = VgpuState::Disabled;
            d.status.uuid.clear();
            d.status.configured_type_name.clear();
        })
        .await?;

        info!(device = device.name(), "vGPU disabled");
        Ok(())
    }

    /// Record and advertise an instance configured outside the agent.
    /// Adoption lands in spec as well as status: the record now declares
    /// what the host already has, so the next reconcile pass converges
    /// on the instance instead of tearing it down as undeclared.
    async fn adopt(&self, device: &VgpuDevice, host: &VgpuHostState, uuid: String) -> Result<()> {
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

        retry_update(self.vgpus.as_ref(), device.name(), |d| {
            d.spec.enabled = true;
            d.spec.vgpu_type_name = configured_type_name.clone();
            d.status.vgpu_status = VgpuState::Enabled;
            d.status.uuid = uuid.clone();
            d.status.configured_type_name = configured_type_name.clone();
        })
        .await?;

        if !configured_type_name.is_empty() {
            self.registry
                .ensure_device(
                    &vgpu_resource_name(&configured_type_name),
                    "VGPU_RESOURCE",
                    PluginDevice {
                        id: uuid.clone(),
                        healthy: true,
                        device_paths: Vec::new(),
                        env_value: None,
                    },
                )
                .await?;
        }

        info!(device = device.name(), uuid = %uuid, "adopted externally configured vGPU");
        Ok(())
    }

    /// Remove the mediated instance and withdraw its plugin device.
    /// An already-removed instance is success, not failure.
    async fn teardown_instance(&self, device: &VgpuDevice) -> Result<()> {
        let uuid = if device.status.uuid.is_empty() {
            match self.scanner.fetch_vgpu_status(&device.spec.address)?.uuid {
                Some(uuid) => uuid,
                None => return Ok(()),
            }
        } else {
            device.status.uuid.clone()
        };

        self.mdev.remove_instance(&device.spec.address, &uuid)?;
        if !device.status.configured_type_name.is_empty() {
            self.registry
                .remove_device(&vgpu_resource_name(&device.status.configured_type_name), &uuid)
                .await;
        }
        Ok(())
    }

    /// Separate pass keyed off status: every record with a live
    /// instance gets its plugin device, covering sessions lost to an
    /// agent restart.
    pub async fn reconcile_enabled_plugins(&self) -> Result<()> {
        for device in self.vgpus.list(Some(&self.node_name)).await? {
            if device.status.vgpu_status != VgpuState::Enabled || device.status.uuid.is_empty() {
                continue;
            }
            let resource = vgpu_resource_name(&device.status.configured_type_name);
            if let Err(e) = self
                .registry
                .ensure_device(
                    &resource,
                    "VGPU_RESOURCE",
                    PluginDevice {
                        id: device.status.uuid.clone(),
                        healthy: true,
                        device_paths: Vec::new(),
                        env_value: None,
                    },
                )
                .await
            {
                warn!(device = device.name(), error = %e, "could not advertise enabled vGPU");
            }
        }
        Ok(())
    }

    /// Startup pass: converge every record on this node.
    pub async fn setup(&self) -> Result<()> {
        for device in self.vgpus.list(Some(&self.node_name)).await? {
            if let Err(e) = self.on_change(&device).await {
                warn!(device = device.name(), error = %e, "vGPU setup failed");
            }
        }
        self.reconcile_enabled_plugins().await
    }
}
