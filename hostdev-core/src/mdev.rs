//! Mediated device (mdev) instance management.
//!
//! A vGPU instance is created by writing a fresh UUID into the chosen
//! type's `create` file and torn down by writing `1` into the
//! instance's `remove` file. The remove file disappearing means the
//! instance is already gone, which callers treat as success.

use crate::error::{HostdevError, Result};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

/// Drives the mdev bus control files for vGPU instances.
#[derive(Debug, Clone)]
pub struct MdevManager {
    mdev_bus_root: PathBuf,
}

impl MdevManager {
    pub fn new(mdev_bus_root: impl Into<PathBuf>) -> Self {
        Self { mdev_bus_root: mdev_bus_root.into() }
    }

    /// Create an instance of `type_dir` on the function at `address`
    /// and return its UUID.
    pub fn create_instance(&self, address: &str, type_dir: &str) -> Result<String> {
        let create = self
            .mdev_bus_root
            .join(address)
            .join("mdev_supported_types")
            .join(type_dir)
            .join("create");
        if !create.exists() {
            return Err(HostdevError::TypeNotAvailable {
                type_name: type_dir.to_string(),
                address: address.to_string(),
            });
        }

        let uuid = Uuid::new_v4().to_string();
        fs::write(&create, &uuid).map_err(|e| HostdevError::io(&create, e))?;
        info!(address = %address, r#type = %type_dir, uuid = %uuid, "created mdev instance");
        Ok(uuid)
    }

    /// Remove the instance `uuid` from the function at `address`.
    /// Returns false when the instance was already gone.
    pub fn remove_instance(&self, address: &str, uuid: &str) -> Result<bool> {
        let remove = self
            .mdev_bus_root
            .join(address)
            .join(uuid)
            .join("remove");
        if !remove.exists() {
            debug!(address = %address, uuid = %uuid, "mdev instance already removed");
            return Ok(false);
        }
        fs::write(&remove, "1").map_err(|e| HostdevError::io(&remove, e))?;
        info!(address = %address, uuid = %uuid, "removed mdev instance");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_instance_writes_uuid() {
        let root = tempfile::tempdir().unwrap();
        let type_path =
            root.path().join("0000:65:00.4").join("mdev_supported_types").join("nvidia-556");
        fs::create_dir_all(&type_path).unwrap();
        fs::write(type_path.join("create"), "").unwrap();

        let manager = MdevManager::new(root.path());
        let uuid = manager.create_instance("0000:65:00.4", "nvidia-556").unwrap();
        assert_eq!(fs::read_to_string(type_path.join("create")).unwrap(), uuid);
        assert!(Uuid::parse_str(&uuid).is_ok());
    }

    #[test]
    fn test_create_instance_unknown_type() {
        let root = tempfile::tempdir().unwrap();
        let manager = MdevManager::new(root.path());
        let err = manager.create_instance("0000:65:00.4", "nvidia-999").unwrap_err();
        assert!(matches!(err, HostdevError::TypeNotAvailable { .. }));
    }

    #[test]
    fn test_remove_instance() {
        let root = tempfile::tempdir().unwrap();
        let uuid = "c73f1fa6-489e-4834-9476-d70dabd98c40";
        let instance = root.path().join("0000:65:00.4").join(uuid);
        fs::create_dir_all(&instance).unwrap();
        fs::write(instance.join("remove"), "").unwrap();

        let manager = MdevManager::new(root.path());
        assert!(manager.remove_instance("0000:65:00.4", uuid).unwrap());
        assert_eq!(fs::read_to_string(instance.join("remove")).unwrap(), "1");

        // Second removal finds no control file and reports already-gone.
        fs::remove_dir_all(&instance).unwrap();
        assert!(!manager.remove_instance("0000:65:00.4", uuid).unwrap());
    }
}
