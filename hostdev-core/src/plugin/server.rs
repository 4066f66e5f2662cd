//! Device-plugin session lifecycle.

use super::health::spawn_health_watch;
use super::service::DevicePluginService;
use crate::error::{HostdevError, Result};
use hostdev_api::v1beta1::device_plugin_server::DevicePluginServer;
use hostdev_api::v1beta1::registration_client::RegistrationClient;
use hostdev_api::v1beta1::{DevicePluginOptions, RegisterRequest};
use hostdev_api::API_VERSION;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tonic::Request;
use tower::service_fn;
use tracing::{error, info, warn};

/// How long a stopping session waits for its watch stream to flush the
/// empty device list to the kubelet.
const DEREGISTER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// One advertised device within a session's pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDevice {
    /// Identifier the kubelet allocates by. The device address for PCI,
    /// the mdev UUID for vGPU.
    pub id: String,
    pub healthy: bool,
    /// Host device nodes handed to the container on allocation.
    pub device_paths: Vec<String>,
    /// What the allocation env var reports for this device when it is
    /// not the id itself, e.g. "2:3" bus/device coordinates for USB.
    pub env_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Running,
    Stopped,
}

/// A running device-plugin session for one resource pool.
pub struct DevicePlugin {
    resource_name: String,
    /// Socket file name under the kubelet plugin directory.
    endpoint: String,
    socket_path: PathBuf,
    kubelet_socket: PathBuf,
    env_prefix: String,

    state: StdMutex<LifecycleState>,
    /// Set when the kubelet wiped the socket out from under us; stop
    /// must not remove whatever a successor session bound in its place.
    socket_lost: AtomicBool,
    devices: Mutex<HashMap<String, PluginDevice>>,
    /// Bumped on every device-set change; the ListAndWatch stream
    /// re-sends the list when it observes a new generation.
    updates: watch::Sender<u64>,
    token: CancellationToken,
    /// Signalled by the watch stream once the empty list went out.
    deregistered: Notify,
    serve_task: StdMutex<Option<JoinHandle<()>>>,
}

impl DevicePlugin {
    pub fn new(
        resource_name: impl Into<String>,
        env_prefix: impl Into<String>,
        plugin_dir: impl AsRef<Path>,
        kubelet_socket: impl Into<PathBuf>,
    ) -> Self {
        let resource_name = resource_name.into();
        let endpoint = format!("hostdev-{}.sock", resource_name.replace(['/', '.'], "-"));
        let socket_path = plugin_dir.as_ref().join(&endpoint);
        let (updates, _) = watch::channel(0);
        Self {
            resource_name,
            endpoint,
            socket_path,
            kubelet_socket: kubelet_socket.into(),
            env_prefix: env_prefix.into(),
            state: StdMutex::new(LifecycleState::NotStarted),
            socket_lost: AtomicBool::new(false),
            devices: Mutex::new(HashMap::new()),
            updates,
            token: CancellationToken::new(),
            deregistered: Notify::new(),
            serve_task: StdMutex::new(None),
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn env_prefix(&self) -> &str {
        &self.env_prefix
    }

    pub(super) fn devices(&self) -> &Mutex<HashMap<String, PluginDevice>> {
        &self.devices
    }

    pub(super) fn subscribe_updates(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }

    pub(super) fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(super) fn notify_deregistered(&self) {
        self.deregistered.notify_waiters();
    }

    pub(super) fn mark_socket_lost(&self) {
        self.socket_lost.store(true, Ordering::SeqCst);
    }

    fn bump(&self) {
        self.updates.send_modify(|generation| *generation += 1);
    }

    /// Add or refresh a device in the advertised pool.
    pub async fn add_device(&self, device: PluginDevice) {
        let mut devices = self.devices.lock().await;
        let changed = devices.get(&device.id) != Some(&device);
        devices.insert(device.id.clone(), device);
        drop(devices);
        if changed {
            self.bump();
        }
    }

    /// Drop a device from the pool. Returns how many remain.
    pub async fn remove_device(&self, id: &str) -> usize {
        let mut devices = self.devices.lock().await;
        let removed = devices.remove(id).is_some();
        let remaining = devices.len();
        drop(devices);
        if removed {
            self.bump();
        }
        remaining
    }

    pub async fn has_device(&self, id: &str) -> bool {
        self.devices.lock().await.contains_key(id)
    }

    pub async fn device_count(&self) -> usize {
        self.devices.lock().await.len()
    }

    /// Flip one device's health and re-advertise the list.
    pub async fn set_health(&self, id: &str, healthy: bool) {
        let mut devices = self.devices.lock().await;
        if let Some(device) = devices.get_mut(id) {
            if device.healthy != healthy {
                device.healthy = healthy;
                drop(devices);
                info!(resource = %self.resource_name, id = %id, healthy, "device health changed");
                self.bump();
            }
        }
    }

    /// Serve the plugin socket and register the pool with the kubelet.
    /// The socket is served before registration so the kubelet's
    /// immediate ListAndWatch call finds it live.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == LifecycleState::Running {
                return Ok(());
            }
            *state = LifecycleState::Running;
        }

        if self.socket_path.exists() {
            tokio::fs::remove_file(&self.socket_path)
                .await
                .map_err(|e| HostdevError::io(&self.socket_path, e))?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| HostdevError::io(&self.socket_path, e))?;
        info!(resource = %self.resource_name, socket = %self.socket_path.display(), "device plugin socket bound");

        let service = DevicePluginService::new(self.clone());
        let shutdown_token = self.token.clone();
        let plugin = self.clone();
        let serve = tokio::spawn(async move {
            let result = Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        shutdown_token.cancelled().await;
                        // Give the watch stream a moment to flush the
                        // empty device list before the transport drops.
                        let _ = timeout(DEREGISTER_FLUSH_TIMEOUT, plugin.deregistered.notified())
                            .await;
                    },
                )
                .await;
            if let Err(e) = result {
                error!(error = %e, "device plugin server error");
            }
        });
        *self.serve_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(serve);

        if let Err(e) = self.register_with_kubelet().await {
            self.stop().await;
            return Err(e);
        }

        spawn_health_watch(self.clone());
        Ok(())
    }

    async fn register_with_kubelet(&self) -> Result<()> {
        let channel = uds_channel(&self.kubelet_socket).await.map_err(|e| {
            HostdevError::PluginRegistration {
                resource: self.resource_name.clone(),
                reason: e.to_string(),
            }
        })?;
        let mut client = RegistrationClient::new(channel);
        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.endpoint.clone(),
            resource_name: self.resource_name.clone(),
            options: Some(DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            }),
        };
        client.register(Request::new(request)).await.map_err(|e| {
            HostdevError::PluginRegistration {
                resource: self.resource_name.clone(),
                reason: e.to_string(),
            }
        })?;
        info!(resource = %self.resource_name, "registered device plugin with kubelet");
        Ok(())
    }

    /// Tear the session down: the watch stream sends an empty device
    /// list so the kubelet forgets the pool, then the server and socket
    /// go away. Safe to call more than once.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == LifecycleState::Stopped {
                return;
            }
            *state = LifecycleState::Stopped;
        }
        info!(resource = %self.resource_name, "stopping device plugin");

        self.token.cancel();
        let task = self.serve_task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "device plugin serve task panicked");
            }
        }
        if !self.socket_lost.load(Ordering::SeqCst) && self.socket_path.exists() {
            if let Err(e) = tokio::fs::remove_file(&self.socket_path).await {
                warn!(socket = %self.socket_path.display(), error = %e, "could not remove plugin socket");
            }
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Dial a Unix socket as a tonic channel. The URI is a placeholder; the
/// connector ignores it and opens the socket.
pub(super) async fn uds_channel(
    socket_path: &Path,
) -> std::result::Result<Channel, tonic::transport::Error> {
    let socket_path = socket_path.to_path_buf();
    Endpoint::from_static("http://localhost")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await
}
