//! kubelet device-plugin gRPC API
//!
//! This crate defines the wire protocol hostdev speaks with the kubelet.
//! The protobuf definitions are in `proto/v1beta1.proto` and
//! code-generated via `tonic-build`.

// Include the generated code
pub mod v1beta1 {
    tonic::include_proto!("v1beta1");
}

/// Device-plugin API version announced during registration.
pub const API_VERSION: &str = "v1beta1";

/// Health value for a device that can be allocated.
pub const HEALTHY: &str = "Healthy";

/// Health value for a device that must not be allocated.
pub const UNHEALTHY: &str = "Unhealthy";

/// Directory where the kubelet expects device-plugin sockets.
pub const DEVICE_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";

/// The kubelet's registration socket inside [`DEVICE_PLUGIN_DIR`].
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";
