//! gRPC surface of a device-plugin session.

use super::resource_env_var;
use super::server::DevicePlugin;
use futures::Stream;
use hostdev_api::v1beta1::device_plugin_server::DevicePlugin as DevicePluginRpc;
use hostdev_api::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DevicePluginOptions,
    DeviceSpec, Empty, ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};
use hostdev_api::{HEALTHY, UNHEALTHY};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// UID the virtualization launcher pod runs under; device nodes are
/// chowned to it on allocation so the VM process can open them.
const LAUNCHER_UID: u32 = 107;

pub struct DevicePluginService {
    plugin: Arc<DevicePlugin>,
}

impl DevicePluginService {
    pub fn new(plugin: Arc<DevicePlugin>) -> Self {
        Self { plugin }
    }

    async fn advertised_devices(&self) -> Vec<Device> {
        let devices = self.plugin.devices().lock().await;
        let mut list: Vec<Device> = devices
            .values()
            .map(|d| Device {
                id: d.id.clone(),
                health: if d.healthy { HEALTHY } else { UNHEALTHY }.to_string(),
                topology: None,
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

#[tonic::async_trait]
impl DevicePluginRpc for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        info!(resource = %self.plugin.resource_name(), "kubelet opened device watch");

        let (tx, rx) = mpsc::unbounded_channel();
        let plugin = self.plugin.clone();
        let token = plugin.cancellation();
        let mut updates = plugin.subscribe_updates();
        let initial = ListAndWatchResponse { devices: self.advertised_devices().await };
        if tx.send(Ok(initial)).is_err() {
            return Err(Status::unavailable("watch stream closed before first send"));
        }

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let devices = {
                            let held = plugin.devices().lock().await;
                            let mut list: Vec<Device> = held
                                .values()
                                .map(|d| Device {
                                    id: d.id.clone(),
                                    health: if d.healthy { HEALTHY } else { UNHEALTHY }
                                        .to_string(),
                                    topology: None,
                                })
                                .collect();
                            list.sort_by(|a, b| a.id.cmp(&b.id));
                            list
                        };
                        if tx.send(Ok(ListAndWatchResponse { devices })).is_err() {
                            break;
                        }
                    }
                    () = token.cancelled() => {
                        // Final empty list tells the kubelet the pool is
                        // gone before the socket disappears.
                        let _ = tx.send(Ok(ListAndWatchResponse { devices: Vec::new() }));
                        plugin.notify_deregistered();
                        break;
                    }
                }
            }
            debug!("device watch task stopped");
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        Ok(Response::new(PreferredAllocationResponse { container_responses: Vec::new() }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let req = request.into_inner();
        let env_key =
            resource_env_var(self.plugin.env_prefix(), self.plugin.resource_name());
        let mut container_responses = Vec::new();

        for container_req in req.container_requests {
            info!(
                resource = %self.plugin.resource_name(),
                ids = ?container_req.devices_ids,
                "allocating devices to container"
            );

            let held = self.plugin.devices().lock().await;
            let mut granted = Vec::new();
            let mut device_specs = Vec::new();
            for id in &container_req.devices_ids {
                let Some(device) = held.get(id) else {
                    // The kubelet can race a removal; skip rather than
                    // fail the whole pod.
                    warn!(id = %id, "allocation requested for unknown device");
                    continue;
                };
                granted.push(device.env_value.clone().unwrap_or_else(|| device.id.clone()));
                for path in &device.device_paths {
                    if let Err(e) = std::os::unix::fs::chown(path, Some(LAUNCHER_UID), None) {
                        warn!(path = %path, error = %e, "could not chown device node");
                    }
                    device_specs.push(DeviceSpec {
                        container_path: path.clone(),
                        host_path: path.clone(),
                        permissions: "mrw".to_string(),
                    });
                }
            }
            drop(held);

            let mut envs = HashMap::new();
            if !granted.is_empty() {
                envs.insert(env_key.clone(), granted.join(","));
            }
            container_responses.push(ContainerAllocateResponse {
                envs,
                mounts: Vec::new(),
                devices: device_specs,
                annotations: HashMap::new(),
            });
        }

        Ok(Response::new(AllocateResponse { container_responses }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        // pre_start_required is false; implemented only to satisfy the
        // service definition.
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
