use hostdev_core::exec::LocalExecutor;
use hostdev_core::plugin::PluginRegistry;
use hostdev_core::reconcile::{PciClaimEngine, SriovGpuEngine, UsbClaimEngine, VgpuEngine};
use hostdev_core::store::{MemoryStore, ObjectStore, WatchEvent};
use hostdev_core::types::{
    PciDevice, PciDeviceClaim, SriovGpuDevice, UsbDevice, UsbDeviceClaim, VgpuDevice,
};
use hostdev_core::{
    init_observability, AgentConfig, DriverBinder, GpuScanner, MdevManager,
    MemoryPermittedDevices, PciScanner, UsbScanner,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize observability FIRST
    init_observability()?;

    let config = AgentConfig::from_env()?;
    info!(node = %config.node_name, "hostdev agent starting");

    // Stores and host-side collaborators
    let pci_devices: Arc<MemoryStore<PciDevice>> = Arc::new(MemoryStore::new());
    let pci_claims: Arc<MemoryStore<PciDeviceClaim>> = Arc::new(MemoryStore::new());
    let usb_devices: Arc<MemoryStore<UsbDevice>> = Arc::new(MemoryStore::new());
    let usb_claims: Arc<MemoryStore<UsbDeviceClaim>> = Arc::new(MemoryStore::new());
    let sriov_gpus: Arc<MemoryStore<SriovGpuDevice>> = Arc::new(MemoryStore::new());
    let vgpus: Arc<MemoryStore<VgpuDevice>> = Arc::new(MemoryStore::new());
    let permitted = Arc::new(MemoryPermittedDevices::new());

    let registry =
        Arc::new(PluginRegistry::new(&config.kubelet_plugin_dir, config.kubelet_socket()));
    let binder = DriverBinder::new(&config.pci_drivers_root);
    let pci_scanner = PciScanner::new(&config.pci_devices_root);
    let usb_scanner = UsbScanner::new(&config.usb_devices_root, &config.dev_root);
    let gpu_scanner = GpuScanner::new(&config.pci_devices_root, &config.mdev_bus_root);
    let mdev = MdevManager::new(&config.mdev_bus_root);
    let executor = Arc::new(LocalExecutor);

    binder.load_passthrough_modules().await;

    // Reconciliation engines
    let pci_engine = Arc::new(PciClaimEngine::new(
        &config.node_name,
        pci_devices.clone(),
        pci_claims.clone(),
        pci_scanner,
        binder,
        permitted.clone(),
        registry.clone(),
        &config.dev_root,
    ));
    let usb_engine = Arc::new(UsbClaimEngine::new(
        &config.node_name,
        usb_devices.clone(),
        usb_claims.clone(),
        usb_scanner,
        permitted.clone(),
        registry.clone(),
    ));
    let sriov_engine = Arc::new(SriovGpuEngine::new(
        &config.node_name,
        sriov_gpus.clone(),
        pci_claims.clone(),
        gpu_scanner.clone(),
        executor,
    ));
    let vgpu_engine = Arc::new(VgpuEngine::new(
        &config.node_name,
        vgpus.clone(),
        gpu_scanner,
        mdev,
        registry.clone(),
    ));

    // Subscribe before the first reconcile so no event slips between
    // startup and the watch loops.
    let pci_claim_events = pci_claims.watch();
    let usb_claim_events = usb_claims.watch();
    let sriov_events = sriov_gpus.watch();
    let vgpu_events = vgpus.watch();

    // Seed the inventory, then recover from whatever happened while the
    // agent was down: reboots reset driver bindings, deleted claims
    // leave orphaned vfio devices.
    pci_engine.sync_devices().await?;
    usb_engine.sync_devices().await?;
    sriov_engine.sync_devices().await?;
    vgpu_engine.sync_devices().await?;

    if let Err(e) = pci_engine.reconcile_claims().await {
        error!(error = %e, "claim reconcile pass failed");
    }
    if let Err(e) = pci_engine.unbind_orphaned().await {
        error!(error = %e, "orphan unbind pass failed");
    }
    sriov_engine.setup().await?;
    vgpu_engine.setup().await?;

    info!("hostdev agent ready");

    let shutdown = CancellationToken::new();

    // Claim and device watch loops
    {
        let engine = pci_engine.clone();
        let token = shutdown.clone();
        tokio::spawn(run_watch(pci_claim_events, token, move |event| {
            let engine = engine.clone();
            async move {
                match event {
                    WatchEvent::Changed(claim) => engine.on_claim_change(&claim).await,
                    WatchEvent::Removed(claim) => engine.on_claim_remove(&claim).await,
                }
            }
        }));
    }
    {
        let engine = usb_engine.clone();
        let token = shutdown.clone();
        tokio::spawn(run_watch(usb_claim_events, token, move |event| {
            let engine = engine.clone();
            async move {
                match event {
                    WatchEvent::Changed(claim) => engine.on_claim_change(&claim).await,
                    WatchEvent::Removed(claim) => engine.on_claim_remove(&claim).await,
                }
            }
        }));
    }
    {
        let engine = sriov_engine.clone();
        let token = shutdown.clone();
        tokio::spawn(run_watch(sriov_events, token, move |event| {
            let engine = engine.clone();
            async move {
                match event {
                    WatchEvent::Changed(gpu) => engine.on_change(&gpu).await,
                    WatchEvent::Removed(_) => Ok(()),
                }
            }
        }));
    }
    {
        let engine = vgpu_engine.clone();
        let token = shutdown.clone();
        tokio::spawn(run_watch(vgpu_events, token, move |event| {
            let engine = engine.clone();
            async move {
                match event {
                    WatchEvent::Changed(device) => engine.on_change(&device).await,
                    WatchEvent::Removed(device) => engine.on_remove(&device).await,
                }
            }
        }));
    }

    // Periodic rescan keeps the inventory converged with hot-plugged
    // hardware and re-advertises anything a kubelet restart dropped.
    {
        let token = shutdown.clone();
        let interval = Duration::from_secs(config.rescan_interval_secs);
        let pci_engine = pci_engine.clone();
        let usb_engine = usb_engine.clone();
        let sriov_engine = sriov_engine.clone();
        let vgpu_engine = vgpu_engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for (name, result) in [
                    ("pci", pci_engine.sync_devices().await),
                    ("usb", usb_engine.sync_devices().await),
                    ("sriov-gpu", sriov_engine.sync_devices().await),
                    ("vgpu", vgpu_engine.sync_devices().await),
                    ("orphans", pci_engine.unbind_orphaned().await),
                    ("pci-claims", pci_engine.reconcile_claims().await),
                    ("usb-claims", usb_engine.reconcile_claims().await),
                    ("vgpu-plugins", vgpu_engine.reconcile_enabled_plugins().await),
                ] {
                    if let Err(e) = result {
                        warn!(pass = name, error = %e, "periodic reconcile pass failed");
                    }
                }
            }
        });
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    shutdown.cancel();

    // Drain the plugin sessions so the kubelet forgets the pools
    // instead of finding dead sockets later.
    registry.stop_all().await;

    info!("hostdev agent shutting down");
    Ok(())
}

/// Consume a store watch stream, dispatching each event to a handler.
/// A lagged subscriber logs and keeps going; the periodic rescan
/// reconverges anything it missed.
async fn run_watch<T, F, Fut>(
    mut events: broadcast::Receiver<WatchEvent<T>>,
    token: CancellationToken,
    handler: F,
) where
    T: Clone + Send + 'static,
    F: Fn(WatchEvent<T>) -> Fut,
    Fut: std::future::Future<Output = hostdev_core::Result<()>>,
{
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if let Err(e) = handler(event).await {
                        error!(error = %e, "reconcile handler failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "watch stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
