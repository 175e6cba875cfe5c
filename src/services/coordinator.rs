//! Scan coordinator - wiring and the interface the presentation layer sees
//!
//! Owns one of each component and the arbiter worker task. Presentation
//! code subscribes to scan events and notices, issues the user commands
//! (open camera, discover, connect, ...) and renders `snapshot()`.

use crate::domain::error::ScanError;
use crate::domain::types::{
    ActiveSource, AdapterState, Capability, ConnectionState, DiscoveredPeripheral, Notice,
    PeripheralId, PermissionState, ScanEvent, Symbology,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::ble::{BleCentral, ScanFilter};
use crate::io::camera::CameraDevice;
use crate::io::feedback::ScanFeedback;
use crate::io::permissions::{PermissionProvider, Platform};
use crate::services::arbiter::{
    ArbiterCommand, ArbiterInputs, ArbiterOutputs, ArbiterSnapshot, ArbiterWorker,
};
use crate::services::connection::ConnectionManager;
use crate::services::discovery::{DeviceDiscovery, DiscoveryEnd, DiscoveryStatus};
use crate::services::optical::OpticalCaptureController;
use crate::services::permission_gate::PermissionGate;
use crate::services::radio::Radio;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Platform capabilities the coordinator drives
pub struct Hardware {
    pub ble: Arc<dyn BleCentral>,
    pub permissions: Arc<dyn PermissionProvider>,
    pub camera: Arc<dyn CameraDevice>,
    pub feedback: Arc<dyn ScanFeedback>,
}

/// Everything a screen needs to render scanning state
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub camera_visible: bool,
    pub camera_permission: PermissionState,
    pub bluetooth_permission: PermissionState,
    pub adapter_state: AdapterState,
    pub connection_state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_peripheral: Option<PeripheralId>,
    pub discovery_active: bool,
    pub discovered_peripherals: Vec<DiscoveredPeripheral>,
    pub active_source: ActiveSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<ScanEvent>,
}

pub struct Coordinator {
    config: Config,
    gate: PermissionGate,
    discovery: DeviceDiscovery,
    connection: ConnectionManager,
    optical: Arc<OpticalCaptureController>,
    cmd_tx: mpsc::Sender<ArbiterCommand>,
    arbiter_rx: watch::Receiver<ArbiterSnapshot>,
    event_tx: broadcast::Sender<ScanEvent>,
    notice_tx: broadcast::Sender<Notice>,
    adapter_rx: Mutex<Option<watch::Receiver<AdapterState>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    discovery_task: Mutex<Option<JoinHandle<DiscoveryEnd>>>,
    shut_down: AtomicBool,
}

impl Coordinator {
    /// Wire the components and spawn the arbiter worker.
    /// Must be called from within a tokio runtime.
    pub fn start(config: Config, hardware: Hardware, metrics: Arc<Metrics>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity());
        let (camera_tx, camera_rx) = mpsc::channel(config.camera_channel_capacity());
        let (ble_tx, ble_rx) = mpsc::channel(config.ble_channel_capacity());
        let (event_tx, _) = broadcast::channel(config.broadcast_capacity());
        let (notice_tx, _) = broadcast::channel(config.broadcast_capacity());

        let symbologies: Vec<Symbology> = config.symbologies().iter().map(Symbology::new).collect();
        let optical = Arc::new(OpticalCaptureController::new(
            hardware.camera,
            symbologies,
            camera_tx,
            metrics.clone(),
        ));

        let (worker, arbiter_rx) = ArbiterWorker::new(
            config.cooldown(),
            optical.clone(),
            ArbiterInputs { cmd_rx, camera_rx, ble_rx },
            ArbiterOutputs {
                event_tx: event_tx.clone(),
                notice_tx: notice_tx.clone(),
                feedback: hardware.feedback,
            },
            metrics.clone(),
        );
        let worker = tokio::spawn(worker.run());

        let radio = Radio::new();
        let filter = ScanFilter {
            services: vec![config.service_uuid()],
            allow_duplicates: config.allow_duplicates(),
        };
        let discovery =
            DeviceDiscovery::new(hardware.ble.clone(), radio.clone(), filter, metrics.clone());
        let connection = ConnectionManager::new(
            &config,
            hardware.ble.clone(),
            radio,
            ble_tx,
            notice_tx.clone(),
            metrics,
        );
        let platform = Platform::from_config(&config);
        let gate = PermissionGate::new(hardware.permissions, platform);

        info!(
            platform = ?platform,
            service_uuid = %config.service_uuid(),
            characteristic_uuid = %config.characteristic_uuid(),
            cooldown_ms = %config.cooldown_ms(),
            discovery_timeout_ms = %config.discovery_timeout_ms(),
            "coordinator_started"
        );

        Self {
            adapter_rx: Mutex::new(Some(hardware.ble.adapter_state())),
            config,
            gate,
            discovery,
            connection,
            optical,
            cmd_tx,
            arbiter_rx,
            event_tx,
            notice_tx,
            worker: Mutex::new(Some(worker)),
            discovery_task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Stream of accepted scans, in emission order
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.event_tx.subscribe()
    }

    /// User-visible notices (link lost, open settings, source busy, ...)
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notice_tx.subscribe()
    }

    /// Entry point for the camera stack's decode callback
    pub fn optical(&self) -> Arc<OpticalCaptureController> {
        self.optical.clone()
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let arbiter = self.arbiter_rx.borrow().clone();
        let connection_state = self.connection.state();
        let adapter_state = self
            .adapter_rx
            .lock()
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or_default();
        CoordinatorSnapshot {
            camera_visible: self.optical.is_visible(),
            camera_permission: self.gate.current(Capability::Camera),
            bluetooth_permission: self.gate.current(Capability::Bluetooth),
            adapter_state,
            connection_state,
            connected_peripheral: match connection_state {
                ConnectionState::Active => self.connection.peripheral(),
                _ => None,
            },
            discovery_active: self.discovery.is_active(),
            discovered_peripherals: self.discovery.discovered(),
            active_source: arbiter.active_source,
            last_event: arbiter.last_event,
        }
    }

    pub fn check_permission(&self, capability: Capability) -> PermissionState {
        self.gate.check_status(capability)
    }

    /// Ask for camera access if needed, then make the camera the active
    /// source. A fresh camera session starts with no last item.
    pub async fn open_camera(&self) -> Result<(), ScanError> {
        self.ensure_running()?;
        self.require_permission(Capability::Camera).await?;

        let (reply, reply_rx) = oneshot::channel();
        self.send_command(ArbiterCommand::ActivateCamera { reply }).await?;
        reply_rx.await.map_err(|_| ScanError::ShutDown)?
    }

    pub async fn close_camera(&self) -> Result<(), ScanError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_command(ArbiterCommand::DeactivateCamera { reply }).await?;
        reply_rx.await.map_err(|_| ScanError::ShutDown)
    }

    /// Open when hidden, close when visible. Returns the new visibility.
    pub async fn toggle_camera(&self) -> Result<bool, ScanError> {
        if self.optical.is_visible() {
            self.close_camera().await?;
            Ok(false)
        } else {
            self.open_camera().await?;
            Ok(true)
        }
    }

    pub async fn clear_last_scan(&self) -> Result<(), ScanError> {
        self.send_command(ArbiterCommand::ClearLast).await
    }

    /// Start a discovery session bounded by the configured timeout. The
    /// session runs in the background; watch `discovery_status()` or call
    /// `discovery_finished()`.
    pub async fn start_discovery(&self) -> Result<(), ScanError> {
        self.ensure_running()?;
        self.require_permission(Capability::Bluetooth).await?;

        let mut session = match self.discovery.start_session(self.config.discovery_timeout()) {
            Ok(session) => session,
            Err(ScanError::AdapterUnavailable(state)) => {
                let _ = self.notice_tx.send(Notice::AdapterUnavailable { state });
                return Err(ScanError::AdapterUnavailable(state));
            }
            Err(err) => return Err(err),
        };

        let notice_tx = self.notice_tx.clone();
        let task = tokio::spawn(async move {
            while let Some(peripheral) = session.next().await {
                info!(
                    session = session.id(),
                    peripheral = %peripheral.id,
                    name = %peripheral.label(),
                    "discovery_peripheral_found"
                );
            }
            let end = session.end().cloned().unwrap_or(DiscoveryEnd::Cancelled);
            if let DiscoveryEnd::AdapterUnavailable(state) = end {
                let _ = notice_tx.send(Notice::AdapterUnavailable { state });
            }
            end
        });
        *self.discovery_task.lock() = Some(task);
        Ok(())
    }

    /// Pick a discovered peripheral; ends the session and frees the radio
    pub async fn select_peripheral(
        &self,
        id: &PeripheralId,
    ) -> Result<DiscoveredPeripheral, ScanError> {
        let peripheral = self.discovery.select_peripheral(id)?;
        self.discovery_finished().await;
        Ok(peripheral)
    }

    pub async fn cancel_discovery(&self) {
        self.discovery.cancel();
        self.discovery_finished().await;
    }

    /// Wait for the background discovery session (if any) to end
    pub async fn discovery_finished(&self) -> Option<DiscoveryEnd> {
        let task = self.discovery_task.lock().take();
        match task {
            Some(task) => task.await.ok(),
            None => None,
        }
    }

    pub fn discovered(&self) -> Vec<DiscoveredPeripheral> {
        self.discovery.discovered()
    }

    pub fn discovery_status(&self) -> watch::Receiver<DiscoveryStatus> {
        self.discovery.status()
    }

    /// Suspend until the adapter is powered on again
    pub async fn wait_for_adapter(&self) -> Result<(), ScanError> {
        self.discovery.wait_for_adapter().await
    }

    pub async fn connect(&self, peripheral: PeripheralId) -> Result<(), ScanError> {
        self.ensure_running()?;
        self.require_permission(Capability::Bluetooth).await?;
        self.connection.connect(peripheral).await
    }

    pub async fn disconnect(&self) -> Result<(), ScanError> {
        self.connection.disconnect().await
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch()
    }

    /// Release everything in order: discovery scan, subscription and link,
    /// camera, arbiter worker, adapter observation. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("coordinator_shutdown_started");

        self.discovery.cancel();
        self.discovery_finished().await;

        if let Err(e) = self.connection.disconnect().await {
            warn!(error = %e, "shutdown_disconnect_failed");
        }

        let (reply, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(ArbiterCommand::DeactivateCamera { reply }).await.is_ok() {
            let _ = reply_rx.await;
        }
        let _ = self.cmd_tx.send(ArbiterCommand::Shutdown).await;
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        self.adapter_rx.lock().take();
        info!("coordinator_shutdown_complete");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    async fn require_permission(&self, capability: Capability) -> Result<(), ScanError> {
        let result = self.gate.require(capability).await;
        if let Err(err) = &result {
            warn!(capability = %capability, error = %err, "permission_required");
            if err.needs_settings() {
                let _ = self.notice_tx.send(Notice::OpenSettings { capability });
            }
        }
        result
    }

    async fn send_command(&self, cmd: ArbiterCommand) -> Result<(), ScanError> {
        self.cmd_tx.send(cmd).await.map_err(|_| ScanError::ShutDown)
    }

    fn ensure_running(&self) -> Result<(), ScanError> {
        if self.is_shut_down() {
            Err(ScanError::ShutDown)
        } else {
            Ok(())
        }
    }
}
