//! Kubelet device-plugin sessions.
//!
//! Each resource pool with at least one claimed device gets one
//! session: a gRPC server on its own socket under the kubelet plugin
//! directory, registered against the kubelet's well-known socket. The
//! [`PluginRegistry`] owns the sessions and enforces the
//! create-on-first-device / stop-on-last-device lifecycle.

mod health;
mod registry;
mod server;
mod service;

pub use registry::PluginRegistry;
pub use server::{DevicePlugin, LifecycleState, PluginDevice};

/// Environment variable key a pool's allocations are reported under,
/// e.g. ("PCI_RESOURCE", "nvidia.com/1eb8") -> "PCI_RESOURCE_NVIDIA_COM_1EB8".
pub fn resource_env_var(prefix: &str, resource_name: &str) -> String {
    let sanitized: String = resource_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}_{}", prefix, sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_env_var() {
        assert_eq!(
            resource_env_var("PCI_RESOURCE", "nvidia.com/1eb8"),
            "PCI_RESOURCE_NVIDIA_COM_1EB8"
        );
        assert_eq!(
            resource_env_var("VGPU_RESOURCE", "nvidia.com/NVIDIA_A40-2Q"),
            "VGPU_RESOURCE_NVIDIA_COM_NVIDIA_A40_2Q"
        );
    }
}
