//! Reconciliation engines.
//!
//! Each engine drives one record family toward its declared state:
//! handlers take the latest copy of an object, read host truth, apply
//! the missing side effects, and write status back. Handlers are
//! idempotent and safe to re-run from scratch, which is also how crash
//! and reboot recovery works.

mod pci_claim;
mod sriov_gpu;
mod usb_claim;
mod vgpu;

pub use pci_claim::PciClaimEngine;
pub use sriov_gpu::SriovGpuEngine;
pub use usb_claim::UsbClaimEngine;
pub use vgpu::VgpuEngine;

use crate::error::Result;
use crate::store::ObjectStore;
use crate::types::StoredObject;
use std::collections::HashSet;
use tracing::debug;

/// Status writes race the watch handlers; a rejected write is retried
/// from the latest copy this many times before giving up.
const CONFLICT_RETRIES: usize = 5;

/// Reconcile a scan result against the store: create records for new
/// hardware, fold fresh observations into existing records, and delete
/// records whose hardware is gone. `merge` decides which stored fields
/// survive a refresh (declared intent does, observations do not).
pub async fn sync_records<T, F>(
    store: &dyn ObjectStore<T>,
    node_name: &str,
    discovered: Vec<T>,
    merge: F,
) -> Result<()>
where
    T: StoredObject + PartialEq,
    F: Fn(&T, T) -> T,
{
    let mut seen = HashSet::new();
    for fresh in discovered {
        seen.insert(fresh.name().to_string());
        match store.get(fresh.name()).await {
            Ok(stored) => {
                let mut merged = merge(&stored, fresh);
                *merged.metadata_mut() = stored.metadata().clone();
                if merged != stored {
                    store.update(merged).await?;
                }
            }
            Err(e) if e.is_not_found() => {
                store.create(fresh).await?;
            }
            Err(e) => return Err(e),
        }
    }

    for stored in store.list(Some(node_name)).await? {
        if !seen.contains(stored.name()) {
            debug!(kind = T::KIND, name = stored.name(), "hardware gone, deleting record");
            store.delete(stored.name()).await?;
        }
    }
    Ok(())
}

/// Apply a status mutation against the latest copy of an object,
/// retrying when another writer got there first.
pub async fn retry_status_update<T, F>(
    store: &dyn ObjectStore<T>,
    name: &str,
    mutate: F,
) -> Result<T>
where
    T: StoredObject,
    F: Fn(&mut T),
{
    retry_write(store, name, mutate, true).await
}

/// Like [`retry_status_update`] but for mutations that touch spec,
/// e.g. adopting observed host configuration into declared intent.
pub async fn retry_update<T, F>(store: &dyn ObjectStore<T>, name: &str, mutate: F) -> Result<T>
where
    T: StoredObject,
    F: Fn(&mut T),
{
    retry_write(store, name, mutate, false).await
}

async fn retry_write<T, F>(
    store: &dyn ObjectStore<T>,
    name: &str,
    mutate: F,
    status_only: bool,
) -> Result<T>
where
    T: StoredObject,
    F: Fn(&mut T),
{
    let mut last_err = None;
    for _ in 0..CONFLICT_RETRIES {
        let mut latest = store.get(name).await?;
        mutate(&mut latest);
        let written = if status_only {
            store.update_status(latest).await
        } else {
            store.update(latest).await
        };
        match written {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() => {
                debug!(kind = T::KIND, name, "write conflicted, retrying");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        crate::error::HostdevError::Internal(format!("update retries exhausted for {name}"))
    }))
}
