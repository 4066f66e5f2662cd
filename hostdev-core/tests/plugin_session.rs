//! Device-plugin session protocol behavior against a fake kubelet.

mod common;

use common::{dial, FakeKubelet};
use hostdev_api::v1beta1::device_plugin_client::DevicePluginClient;
use hostdev_api::v1beta1::Empty;
use hostdev_api::{API_VERSION, HEALTHY, UNHEALTHY};
use hostdev_core::plugin::{DevicePlugin, LifecycleState, PluginDevice, PluginRegistry};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn device(id: &str) -> PluginDevice {
    PluginDevice { id: id.into(), healthy: true, device_paths: Vec::new(), env_value: None }
}

#[tokio::test]
async fn test_session_registers_and_streams_device_list() {
    let dir = TempDir::new().unwrap();
    let kubelet = FakeKubelet::start(dir.path()).await;

    let plugin = Arc::new(DevicePlugin::new(
        "nvidia.com/1eb8",
        "PCI_RESOURCE",
        dir.path(),
        &kubelet.socket_path,
    ));
    plugin.add_device(device("0000:3b:00.0")).await;
    plugin.clone().start().await.unwrap();

    // Registration carried the right coordinates.
    let registrations = kubelet.registrations().await;
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].version, API_VERSION);
    assert_eq!(registrations[0].resource_name, "nvidia.com/1eb8");
    assert!(registrations[0].endpoint.ends_with(".sock"));
    assert!(plugin.socket_path().exists());

    // The kubelet's first ListAndWatch read is the current device set.
    let mut client = DevicePluginClient::new(dial(plugin.socket_path()).await);
    let mut stream =
        client.list_and_watch(Empty {}).await.unwrap().into_inner();

    let initial = stream.message().await.unwrap().unwrap();
    assert_eq!(initial.devices.len(), 1);
    assert_eq!(initial.devices[0].id, "0000:3b:00.0");
    assert_eq!(initial.devices[0].health, HEALTHY);

    // Pool changes flow through as fresh lists.
    plugin.add_device(device("0000:3b:00.1")).await;
    let update = stream.message().await.unwrap().unwrap();
    assert_eq!(update.devices.len(), 2);

    plugin.set_health("0000:3b:00.1", false).await;
    let update = stream.message().await.unwrap().unwrap();
    let unhealthy: Vec<_> =
        update.devices.iter().filter(|d| d.health == UNHEALTHY).collect();
    assert_eq!(unhealthy.len(), 1);
    assert_eq!(unhealthy[0].id, "0000:3b:00.1");

    // Stopping drains the pool before the socket goes away.
    let stopper = plugin.clone();
    let stop = tokio::spawn(async move { stopper.stop().await });
    let last = stream.message().await.unwrap().unwrap();
    assert!(last.devices.is_empty());

    tokio::time::timeout(Duration::from_secs(5), stop).await.unwrap().unwrap();
    assert_eq!(plugin.lifecycle(), LifecycleState::Stopped);
    assert!(!plugin.socket_path().exists());
}

#[tokio::test]
async fn test_allocate_reports_envs_and_device_nodes() {
    let dir = TempDir::new().unwrap();
    let kubelet = FakeKubelet::start(dir.path()).await;

    let device_node = dir.path().join("vfio-42");
    std::fs::write(&device_node, "").unwrap();

    let plugin = Arc::new(DevicePlugin::new(
        "nvidia.com/1eb8",
        "PCI_RESOURCE",
        dir.path(),
        &kubelet.socket_path,
    ));
    plugin
        .add_device(PluginDevice {
            id: "0000:3b:00.0".into(),
            healthy: true,
            device_paths: vec![device_node.display().to_string()],
            env_value: None,
        })
        .await;
    plugin.clone().start().await.unwrap();

    let mut client = DevicePluginClient::new(dial(plugin.socket_path()).await);
    let response = client
        .allocate(hostdev_api::v1beta1::AllocateRequest {
            container_requests: vec![hostdev_api::v1beta1::ContainerAllocateRequest {
                // One granted device, one the kubelet raced past a
                // removal; the unknown ID is skipped, not fatal.
                devices_ids: vec!["0000:3b:00.0".into(), "0000:ff:00.0".into()],
            }],
        })
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.container_responses.len(), 1);
    let container = &response.container_responses[0];
    assert_eq!(
        container.envs.get("PCI_RESOURCE_NVIDIA_COM_1EB8").map(String::as_str),
        Some("0000:3b:00.0")
    );
    assert_eq!(container.devices.len(), 1);
    assert_eq!(container.devices[0].host_path, device_node.display().to_string());
    assert_eq!(container.devices[0].permissions, "mrw");

    plugin.stop().await;
}

#[tokio::test]
async fn test_wiped_socket_session_is_replaced() {
    let dir = TempDir::new().unwrap();
    let kubelet = FakeKubelet::start(dir.path()).await;
    let registry = PluginRegistry::new(dir.path(), &kubelet.socket_path);

    registry
        .ensure_device("nvidia.com/1eb8", "PCI_RESOURCE", device("0000:3b:00.0"))
        .await
        .unwrap();
    assert_eq!(kubelet.registrations().await.len(), 1);

    // A kubelet restart clears its plugin directory, sockets included.
    let socket = dir.path().join("hostdev-nvidia-com-1eb8.sock");
    std::fs::remove_file(&socket).unwrap();

    // The health watch stops the dead session; the next reconcile pass
    // through the registry must build a fresh one and re-register it.
    let mut registrations = kubelet.registrations().await.len();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry
            .ensure_device("nvidia.com/1eb8", "PCI_RESOURCE", device("0000:3b:00.0"))
            .await
            .unwrap();
        registrations = kubelet.registrations().await.len();
        if registrations >= 2 {
            break;
        }
    }
    assert!(registrations >= 2, "session was never re-registered after socket loss");
    assert!(socket.exists());
    assert!(registry.has_device("nvidia.com/1eb8", "0000:3b:00.0").await);
}

#[tokio::test]
async fn test_start_fails_without_kubelet() {
    let dir = TempDir::new().unwrap();
    let plugin = Arc::new(DevicePlugin::new(
        "nvidia.com/1eb8",
        "PCI_RESOURCE",
        dir.path(),
        dir.path().join("kubelet.sock"),
    ));

    let err = plugin.clone().start().await.unwrap_err();
    assert!(matches!(err, hostdev_core::HostdevError::PluginRegistration { .. }));
    // A failed start cleans up after itself.
    assert_eq!(plugin.lifecycle(), LifecycleState::Stopped);
    assert!(!plugin.socket_path().exists());
}
