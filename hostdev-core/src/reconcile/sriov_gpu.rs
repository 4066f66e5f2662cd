//! SR-IOV GPU reconciliation.
//!
//! Virtual functions are toggled through the vendor management binary,
//! but the binary's exit code is not the source of truth: after every
//! toggle the VF list is re-derived from sysfs and that is what lands
//! in status.

use super::{retry_status_update, sync_records};
use crate::error::Result;
use crate::exec::CommandExecutor;
use crate::inventory::GpuScanner;
use crate::store::ObjectStore;
use crate::types::{PciDeviceClaim, SriovGpuDevice, StoredObject};
use std::sync::Arc;
use tracing::{info, warn};

/// Vendor binary that flips SR-IOV on a physical GPU.
const SRIOV_MANAGE: &str = "sriov-manage";

pub struct SriovGpuEngine {
    node_name: String,
    gpus: Arc<dyn ObjectStore<SriovGpuDevice>>,
    pci_claims: Arc<dyn ObjectStore<PciDeviceClaim>>,
    scanner: GpuScanner,
    executor: Arc<dyn CommandExecutor>,
}

impl SriovGpuEngine {
    pub fn new(
        node_name: impl Into<String>,
        gpus: Arc<dyn ObjectStore<SriovGpuDevice>>,
        pci_claims: Arc<dyn ObjectStore<PciDeviceClaim>>,
        scanner: GpuScanner,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            gpus,
            pci_claims,
            scanner,
            executor,
        }
    }

    /// Refresh the stored SR-IOV GPU inventory. Declared enablement and
    /// the vGPU back-references are reconcile state and survive.
    pub async fn sync_devices(&self) -> Result<()> {
        let discovered = self.scanner.identify_sriov_gpus(&self.node_name)?;
        sync_records(self.gpus.as_ref(), &self.node_name, discovered, |stored, mut fresh| {
            fresh.spec.enabled = stored.spec.enabled;
            fresh.status.vgpu_devices = stored.status.vgpu_devices.clone();
            fresh
        })
        .await
    }

    /// Converge one GPU's VF state with its declared enablement.
    pub async fn on_change(&self, gpu: &SriovGpuDevice) -> Result<()> {
        if gpu.spec.node_name != self.node_name {
            return Ok(());
        }
        let address = &gpu.spec.address;
        let vf_enabled = !self.scanner.vf_addresses(address).is_empty();

        if gpu.spec.enabled && !vf_enabled {
            info!(address = %address, "enabling SR-IOV virtual functions");
            self.executor.run(SRIOV_MANAGE, &["-e", address]).await?;
        } else if !gpu.spec.enabled && vf_enabled {
            info!(address = %address, "disabling SR-IOV virtual functions");
            self.executor.run(SRIOV_MANAGE, &["-d", address]).await?;
        }

        // Status reflects what sysfs says now, whatever the command
        // claimed.
        let vf_addresses = self.scanner.vf_addresses(address);
        let vf_enabled = !vf_addresses.is_empty();
        if gpu.status.vf_addresses != vf_addresses || gpu.status.vf_enabled != vf_enabled {
            retry_status_update(self.gpus.as_ref(), gpu.name(), |g| {
                g.status.vf_addresses = vf_addresses.clone();
                g.status.vf_enabled = vf_enabled;
            })
            .await?;
        }
        Ok(())
    }

    /// Startup pass over every GPU on this node. A GPU whose physical
    /// function is claimed for whole-device passthrough is left alone;
    /// splitting it into VFs would yank it out from under the claim.
    pub async fn setup(&self) -> Result<()> {
        for gpu in self.gpus.list(Some(&self.node_name)).await? {
            if self.physical_function_claimed(&gpu).await? {
                warn!(address = %gpu.spec.address, "GPU claimed for passthrough, skipping SR-IOV setup");
                continue;
            }
            if let Err(e) = self.on_change(&gpu).await {
                warn!(gpu = gpu.name(), error = %e, "SR-IOV setup failed");
            }
        }
        Ok(())
    }

    async fn physical_function_claimed(&self, gpu: &SriovGpuDevice) -> Result<bool> {
        Ok(self
            .pci_claims
            .list(Some(&self.node_name))
            .await?
            .iter()
            .any(|claim| claim.spec.address == gpu.spec.address))
    }
}
