//! Tests for the scan arbiter and its worker

use super::*;
use crate::domain::types::Notice;
use crate::infra::metrics::Metrics;
use crate::io::camera::CameraDecode;
use crate::io::feedback::ScanFeedback;
use crate::io::sim::SimCamera;
use crate::services::optical::OpticalCaptureController;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

const COOLDOWN: Duration = Duration::from_millis(2000);

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn ean13() -> Symbology {
    Symbology::new("EAN13")
}

fn scanner() -> PeripheralId {
    PeripheralId::new("C4:7F:51:00:12:34")
}

// --- state machine ---

#[test]
fn test_camera_decode_emits_and_enters_cooldown() {
    let mut arbiter = ScanArbiter::new(COOLDOWN);
    let now = Instant::now();
    arbiter.activate_camera().unwrap();
    assert_eq!(arbiter.active_source(), ActiveSource::Camera);

    let Intake::Emitted(event) = arbiter.on_camera_decode(ean13(), "012345678905", now) else {
        panic!("expected emission");
    };
    assert_eq!(event.source, SourceKind::Camera);
    assert_eq!(event.symbology.as_str(), "EAN13");
    assert_eq!(event.payload, "012345678905");
    assert_eq!(arbiter.phase(), &ArbiterPhase::Cooldown);
    assert_eq!(arbiter.cooldown_until(), Some(now + COOLDOWN));
    assert_eq!(arbiter.last_event(), Some(&event));
    assert_eq!(arbiter.active_source(), ActiveSource::None);
}

#[test]
fn test_duplicate_decodes_within_window_emit_once() {
    let mut arbiter = ScanArbiter::new(COOLDOWN);
    let start = Instant::now();
    arbiter.activate_camera().unwrap();

    let mut emitted = 0;
    for i in 0..20 {
        let now = start + millis(i * 50);
        if matches!(arbiter.on_camera_decode(ean13(), "012345678905", now), Intake::Emitted(_)) {
            emitted += 1;
        }
        // an immediate re-open must not re-trigger on stale frames
        arbiter.activate_camera().unwrap();
    }
    assert_eq!(emitted, 1);
}

#[test]
fn test_reopen_during_cooldown_stays_suppressed() {
    let mut arbiter = ScanArbiter::new(COOLDOWN);
    let start = Instant::now();
    arbiter.activate_camera().unwrap();
    assert!(matches!(arbiter.on_camera_decode(ean13(), "1", start), Intake::Emitted(_)));

    arbiter.activate_camera().unwrap();
    assert_eq!(arbiter.phase(), &ArbiterPhase::CameraActive);
    assert!(arbiter.last_event().is_none());
    assert_eq!(arbiter.on_camera_decode(ean13(), "2", start + millis(1999)), Intake::Suppressed);

    assert!(arbiter.expire_cooldown(start + COOLDOWN));
    assert_eq!(arbiter.phase(), &ArbiterPhase::CameraActive);
    assert!(matches!(
        arbiter.on_camera_decode(ean13(), "2", start + COOLDOWN),
        Intake::Emitted(e) if e.payload == "2"
    ));
}

#[test]
fn test_cooldown_expires_to_idle() {
    let mut arbiter = ScanArbiter::new(COOLDOWN);
    let start = Instant::now();
    arbiter.activate_camera().unwrap();
    arbiter.on_camera_decode(ean13(), "1", start);

    assert!(!arbiter.expire_cooldown(start + millis(1000)));
    assert_eq!(arbiter.phase(), &ArbiterPhase::Cooldown);
    assert!(arbiter.expire_cooldown(start + COOLDOWN));
    assert_eq!(arbiter.phase(), &ArbiterPhase::Idle);
    assert!(arbiter.cooldown_until().is_none());
    // the item stays visible after the window
    assert!(arbiter.last_event().is_some());
}

#[test]
fn test_decode_after_emission_is_suppressed_not_inactive() {
    let mut arbiter = ScanArbiter::new(COOLDOWN);
    let start = Instant::now();
    arbiter.activate_camera().unwrap();
    assert!(matches!(arbiter.on_camera_decode(ean13(), "1", start), Intake::Emitted(_)));
    assert_eq!(arbiter.phase(), &ArbiterPhase::Cooldown);

    assert_eq!(arbiter.on_camera_decode(ean13(), "1", start + millis(10)), Intake::Suppressed);
    assert_eq!(arbiter.on_camera_decode(ean13(), "1", start + millis(1999)), Intake::Suppressed);
    // deadline passed but the timer has not fired yet: camera is closed
    assert_eq!(arbiter.on_camera_decode(ean13(), "1", start + COOLDOWN), Intake::Inactive);
}

#[test]
fn test_decode_while_bluetooth_active_in_cooldown_is_inactive() {
    let mut arbiter = ScanArbiter::new(COOLDOWN);
    let start = Instant::now();
    arbiter.activate_camera().unwrap();
    arbiter.on_camera_decode(ean13(), "1", start);
    arbiter.link_bluetooth(scanner()).unwrap();

    assert_eq!(arbiter.on_camera_decode(ean13(), "2", start + millis(100)), Intake::Inactive);
}

#[test]
fn test_decode_while_idle_is_inactive() {
    let mut arbiter = ScanArbiter::new(COOLDOWN);
    assert_eq!(arbiter.on_camera_decode(ean13(), "1", Instant::now()), Intake::Inactive);
    assert!(arbiter.last_event().is_none());
}

#[test]
fn test_bluetooth_rejected_while_camera_active() {
    let mut arbiter = ScanArbiter::new(COOLDOWN);
    arbiter.activate_camera().unwrap();
    let before = arbiter.snapshot();

    let err = arbiter.link_bluetooth(scanner()).unwrap_err();
    assert_eq!(err, ScanError::SourceBusy(SourceKind::BluetoothPeripheral));
    assert_eq!(arbiter.phase(), &before.phase);
    assert_eq!(arbiter.cooldown_until(), before.cooldown_until);
}

#[test]
fn test_camera_rejected_while_bluetooth_active() {
    let mut arbiter = ScanArbiter::new(COOLDOWN);
    arbiter.link_bluetooth(scanner()).unwrap();
    assert!(matches!(arbiter.on_ble_data(&scanner(), "A1"), Intake::Emitted(_)));
    let before = arbiter.snapshot();

    let err = arbiter.activate_camera().unwrap_err();
    assert_eq!(err, ScanError::SourceBusy(SourceKind::Camera));
    assert_eq!(arbiter.phase(), &before.phase);
    assert_eq!(arbiter.last_event(), before.last_event.as_ref());
}

#[test]
fn test_every_ble_payload_emits() {
    let mut arbiter = ScanArbiter::new(COOLDOWN);
    arbiter.link_bluetooth(scanner()).unwrap();
    for _ in 0..5 {
        let Intake::Emitted(event) = arbiter.on_ble_data(&scanner(), "SAME") else {
            panic!("ble payloads are never suppressed");
        };
        assert_eq!(event.source, SourceKind::BluetoothPeripheral);
        assert_eq!(event.peripheral, Some(scanner()));
    }
    assert_eq!(arbiter.on_ble_data(&scanner(), "   "), Intake::Empty);
    assert_eq!(arbiter.on_ble_data(&PeripheralId::new("other"), "x"), Intake::Inactive);
}

#[test]
fn test_unlink_returns_to_idle() {
    let mut arbiter = ScanArbiter::new(COOLDOWN);
    arbiter.link_bluetooth(scanner()).unwrap();
    arbiter.unlink_bluetooth(&PeripheralId::new("other"), Instant::now());
    assert!(matches!(arbiter.phase(), ArbiterPhase::BluetoothActive { .. }));
    arbiter.unlink_bluetooth(&scanner(), Instant::now());
    assert_eq!(arbiter.phase(), &ArbiterPhase::Idle);
    assert_eq!(arbiter.on_ble_data(&scanner(), "late"), Intake::Inactive);
}

#[test]
fn test_close_camera_during_reopened_cooldown() {
    let mut arbiter = ScanArbiter::new(COOLDOWN);
    let start = Instant::now();
    arbiter.activate_camera().unwrap();
    arbiter.on_camera_decode(ean13(), "1", start);
    arbiter.activate_camera().unwrap();

    arbiter.deactivate_camera(start + millis(500));
    assert_eq!(arbiter.phase(), &ArbiterPhase::Cooldown);
    // bluetooth may take over while the camera is closed
    arbiter.link_bluetooth(scanner()).unwrap();
}

// --- worker ---

#[derive(Default)]
struct RecordingFeedback {
    seen: Mutex<Vec<String>>,
}

impl ScanFeedback for RecordingFeedback {
    fn scan_succeeded(&self, event: &ScanEvent) {
        self.seen.lock().push(event.payload.clone());
    }
}

/// Test harness that keeps the worker's peers alive
struct TestWorker {
    cmd_tx: mpsc::Sender<ArbiterCommand>,
    ble_tx: mpsc::Sender<BleInput>,
    optical: Arc<OpticalCaptureController>,
    camera: Arc<SimCamera>,
    events: broadcast::Receiver<ScanEvent>,
    notices: broadcast::Receiver<Notice>,
    snapshot: watch::Receiver<ArbiterSnapshot>,
    feedback: Arc<RecordingFeedback>,
    metrics: Arc<Metrics>,
}

fn spawn_worker() -> TestWorker {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (camera_tx, camera_rx) = mpsc::channel::<CameraDecode>(64);
    let (ble_tx, ble_rx) = mpsc::channel(64);
    let (event_tx, events) = broadcast::channel(64);
    let (notice_tx, notices) = broadcast::channel(64);
    let metrics = Arc::new(Metrics::new());
    let camera = Arc::new(SimCamera::default());
    let symbologies = vec![Symbology::new("ean13"), Symbology::new("qr")];
    let optical = Arc::new(OpticalCaptureController::new(
        camera.clone(),
        symbologies,
        camera_tx,
        metrics.clone(),
    ));
    let feedback = Arc::new(RecordingFeedback::default());

    let (worker, snapshot) = ArbiterWorker::new(
        COOLDOWN,
        optical.clone(),
        ArbiterInputs { cmd_rx, camera_rx, ble_rx },
        ArbiterOutputs { event_tx, notice_tx, feedback: feedback.clone() },
        metrics.clone(),
    );
    tokio::spawn(worker.run());
    TestWorker { cmd_tx, ble_tx, optical, camera, events, notices, snapshot, feedback, metrics }
}

impl TestWorker {
    async fn activate_camera(&self) -> Result<(), ScanError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(ArbiterCommand::ActivateCamera { reply }).await.unwrap();
        rx.await.unwrap()
    }

    async fn link(&self, peripheral: PeripheralId) -> Result<(), ScanError> {
        let (reply, rx) = oneshot::channel();
        self.ble_tx.send(BleInput::Linked { peripheral, reply }).await.unwrap();
        rx.await.unwrap()
    }

    async fn settle(&self) {
        // a round trip through the command channel drains earlier input
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(ArbiterCommand::DeactivateCamera { reply }).await.unwrap();
        rx.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_worker_ean13_scenario() {
    let mut w = spawn_worker();
    w.activate_camera().await.unwrap();
    assert!(w.camera.is_streaming());

    assert!(w.optical.on_decode(ean13(), "012345678905"));
    let event = w.events.recv().await.unwrap();
    assert_eq!(event.source, SourceKind::Camera);
    assert_eq!(event.symbology.as_str(), "EAN13");
    assert_eq!(event.payload, "012345678905");

    // camera closed on emission, arbiter in cooldown
    assert!(!w.optical.is_visible());
    assert!(!w.camera.is_streaming());
    let snapshot = w.snapshot.borrow_and_update().clone();
    assert_eq!(snapshot.phase, ArbiterPhase::Cooldown);
    assert_eq!(snapshot.last_event.map(|e| e.id), Some(event.id));
    assert_eq!(*w.feedback.seen.lock(), vec!["012345678905".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_worker_burst_emits_once() {
    let mut w = spawn_worker();
    w.activate_camera().await.unwrap();

    // queued before the worker runs, as a camera delivering several frames
    let mut queued = 0;
    for _ in 0..5 {
        if w.optical.on_decode(ean13(), "012345678905") {
            queued += 1;
        }
    }
    assert_eq!(queued, 5);
    w.settle().await;

    assert!(w.events.recv().await.is_ok());
    assert!(w.events.try_recv().is_err());
    assert_eq!(w.metrics.cooldown_suppressed_total(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_worker_cooldown_timer_returns_to_idle() {
    let mut w = spawn_worker();
    w.activate_camera().await.unwrap();
    w.optical.on_decode(ean13(), "1");
    w.events.recv().await.unwrap();

    let idle = w
        .snapshot
        .wait_for(|s| s.phase == ArbiterPhase::Idle)
        .await
        .map(|s| s.cooldown_until.is_none())
        .unwrap();
    assert!(idle);
}

#[tokio::test(start_paused = true)]
async fn test_worker_rejects_bluetooth_while_camera_open() {
    let mut w = spawn_worker();
    w.activate_camera().await.unwrap();

    let err = w.link(scanner()).await.unwrap_err();
    assert_eq!(err, ScanError::SourceBusy(SourceKind::BluetoothPeripheral));
    assert_eq!(
        w.notices.recv().await.unwrap(),
        Notice::SourceBusy { requested: SourceKind::BluetoothPeripheral }
    );
    assert_eq!(w.snapshot.borrow().phase, ArbiterPhase::CameraActive);
    assert!(w.optical.is_visible());
    assert_eq!(w.metrics.activation_rejected_total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_worker_rejects_camera_while_bluetooth_active() {
    let mut w = spawn_worker();
    w.link(scanner()).await.unwrap();

    let err = w.activate_camera().await.unwrap_err();
    assert_eq!(err, ScanError::SourceBusy(SourceKind::Camera));
    assert!(!w.optical.is_visible());
    assert!(!w.camera.is_streaming());
    assert_eq!(
        w.snapshot.borrow().active_source,
        ActiveSource::Bluetooth { peripheral: scanner() }
    );
    assert!(matches!(w.notices.recv().await, Ok(Notice::SourceBusy { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_worker_ble_data_each_emitted() {
    let mut w = spawn_worker();
    w.link(scanner()).await.unwrap();
    for payload in ["A", "A", "B"] {
        w.ble_tx
            .send(BleInput::Data { peripheral: scanner(), payload: payload.to_string() })
            .await
            .unwrap();
    }
    let mut payloads = Vec::new();
    for _ in 0..3 {
        payloads.push(w.events.recv().await.unwrap().payload);
    }
    assert_eq!(payloads, vec!["A", "A", "B"]);

    w.ble_tx.send(BleInput::Unlinked { peripheral: scanner() }).await.unwrap();
    w.settle().await;
    assert_eq!(w.snapshot.borrow().active_source, ActiveSource::None);
}

#[tokio::test(start_paused = true)]
async fn test_worker_clear_last_and_shutdown() {
    let mut w = spawn_worker();
    w.activate_camera().await.unwrap();
    w.optical.on_decode(ean13(), "1");
    w.events.recv().await.unwrap();

    w.cmd_tx.send(ArbiterCommand::ClearLast).await.unwrap();
    w.settle().await;
    assert!(w.snapshot.borrow().last_event.is_none());

    w.activate_camera().await.unwrap();
    w.cmd_tx.send(ArbiterCommand::Shutdown).await.unwrap();
    // worker exit drops the broadcast sender
    assert!(matches!(w.events.recv().await, Err(broadcast::error::RecvError::Closed)));
    assert!(!w.optical.is_visible());
}
