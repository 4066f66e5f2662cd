//! Shared test fixtures: a fake kubelet and sysfs snapshot builders.
#![allow(dead_code)]

use hostdev_api::v1beta1::registration_server::{Registration, RegistrationServer};
use hostdev_api::v1beta1::{Empty, RegisterRequest};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Response, Status};
use tower::service_fn;

/// Dial a plugin's Unix socket the way the kubelet would.
pub async fn dial(socket_path: &Path) -> Channel {
    let socket_path = socket_path.to_path_buf();
    Endpoint::from_static("http://localhost")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                UnixStream::connect(socket_path)
                    .await
                    .map(TokioIo::new)
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            }
        }))
        .await
        .expect("dial plugin socket")
}

/// In-process stand-in for the kubelet's Registration service. Records
/// every RegisterRequest it receives.
pub struct FakeKubelet {
    pub socket_path: PathBuf,
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
    token: CancellationToken,
}

struct RegistrationService {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for RegistrationService {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.requests.lock().await.push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

impl FakeKubelet {
    /// Serve a Registration endpoint on `dir`/kubelet.sock.
    pub async fn start(dir: &Path) -> Self {
        let socket_path = dir.join("kubelet.sock");
        let listener = UnixListener::bind(&socket_path).expect("bind fake kubelet socket");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();

        let service = RegistrationService { requests: requests.clone() };
        let shutdown = token.clone();
        tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(RegistrationServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    shutdown.cancelled(),
                )
                .await;
        });

        Self { socket_path, requests, token }
    }

    pub async fn registrations(&self) -> Vec<RegisterRequest> {
        self.requests.lock().await.clone()
    }
}

impl Drop for FakeKubelet {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Lay down a PCI device dir with vendor/device attributes and an
/// optional driver binding, in both the device tree and the driver tree.
pub fn seed_pci_device(
    devices_root: &Path,
    drivers_root: &Path,
    address: &str,
    vendor: &str,
    device: &str,
    driver: Option<&str>,
    iommu_group: &str,
) {
    let dev = devices_root.join(address);
    std::fs::create_dir_all(&dev).unwrap();
    std::fs::write(dev.join("vendor"), format!("{}\n", vendor)).unwrap();
    std::fs::write(dev.join("device"), format!("{}\n", device)).unwrap();

    let group_dir = devices_root.join("iommu_groups").join(iommu_group);
    std::fs::create_dir_all(&group_dir).unwrap();
    std::os::unix::fs::symlink(&group_dir, dev.join("iommu_group")).unwrap();

    if let Some(driver) = driver {
        let driver_dir = drivers_root.join(driver);
        std::fs::create_dir_all(&driver_dir).unwrap();
        std::fs::write(driver_dir.join("unbind"), "").unwrap();
        std::fs::create_dir_all(driver_dir.join(address)).unwrap();
        std::os::unix::fs::symlink(&driver_dir, dev.join("driver")).unwrap();
    }
}

/// Lay down the vfio-pci driver dir with its new_id control file.
pub fn seed_vfio_driver(drivers_root: &Path) {
    let vfio = drivers_root.join("vfio-pci");
    std::fs::create_dir_all(&vfio).unwrap();
    std::fs::write(vfio.join("new_id"), "").unwrap();
    std::fs::write(vfio.join("unbind"), "").unwrap();
}
