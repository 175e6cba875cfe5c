//! Arbiter worker - single-task event loop around `ScanArbiter`
//!
//! Merges coordinator commands, camera decodes and BLE traffic. Side
//! effects of a transition (closing the camera, broadcasting the event,
//! feedback, notices) are applied here, never inside the state machine.

use super::{ArbiterCommand, ArbiterSnapshot, BleInput, Intake, ScanArbiter};
use crate::domain::error::ScanError;
use crate::domain::types::{Notice, ScanEvent, SourceKind};
use crate::infra::metrics::Metrics;
use crate::io::camera::CameraDecode;
use crate::io::feedback::ScanFeedback;
use crate::services::optical::OpticalCaptureController;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

/// Receivers the worker consumes
pub struct ArbiterInputs {
    pub cmd_rx: mpsc::Receiver<ArbiterCommand>,
    pub camera_rx: mpsc::Receiver<CameraDecode>,
    pub ble_rx: mpsc::Receiver<BleInput>,
}

/// Where accepted scans and notices go
pub struct ArbiterOutputs {
    pub event_tx: broadcast::Sender<ScanEvent>,
    pub notice_tx: broadcast::Sender<Notice>,
    pub feedback: Arc<dyn ScanFeedback>,
}

pub struct ArbiterWorker {
    arbiter: ScanArbiter,
    optical: Arc<OpticalCaptureController>,
    inputs: ArbiterInputs,
    outputs: ArbiterOutputs,
    snapshot_tx: watch::Sender<ArbiterSnapshot>,
    metrics: Arc<Metrics>,
}

impl ArbiterWorker {
    pub fn new(
        cooldown: Duration,
        optical: Arc<OpticalCaptureController>,
        inputs: ArbiterInputs,
        outputs: ArbiterOutputs,
        metrics: Arc<Metrics>,
    ) -> (Self, watch::Receiver<ArbiterSnapshot>) {
        let arbiter = ScanArbiter::new(cooldown);
        let (snapshot_tx, snapshot_rx) = watch::channel(arbiter.snapshot());
        (Self { arbiter, optical, inputs, outputs, snapshot_tx, metrics }, snapshot_rx)
    }

    /// Run until `Shutdown` or until every command sender is gone
    pub async fn run(mut self) {
        info!(cooldown_ms = %self.arbiter.cooldown.as_millis(), "scan_arbiter_started");

        loop {
            let cooldown_deadline = self.arbiter.cooldown_until();
            tokio::select! {
                // input queued before a command is handled before it
                biased;
                Some(input) = self.inputs.ble_rx.recv() => self.handle_ble(input),
                Some(decode) = self.inputs.camera_rx.recv() => self.handle_decode(decode),
                cmd = self.inputs.cmd_rx.recv() => match cmd {
                    Some(ArbiterCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                _ = cooldown_elapsed(cooldown_deadline) => {
                    if self.arbiter.expire_cooldown(Instant::now()) {
                        debug!(phase = %self.arbiter.phase().as_str(), "cooldown_expired");
                        self.publish();
                    }
                }
            }
        }

        self.optical.set_visible(false);
        self.arbiter.deactivate_camera(Instant::now());
        self.publish();
        info!("scan_arbiter_stopped");
    }

    fn handle_command(&mut self, cmd: ArbiterCommand) {
        match cmd {
            ArbiterCommand::ActivateCamera { reply } => {
                let result = self.arbiter.activate_camera();
                match &result {
                    Ok(()) => {
                        self.optical.set_visible(true);
                        info!(
                            cooldown_pending = self.arbiter.cooldown_until().is_some(),
                            "camera_source_activated"
                        );
                        self.publish();
                    }
                    Err(err) => self.reject(SourceKind::Camera, err),
                }
                let _ = reply.send(result);
            }
            ArbiterCommand::DeactivateCamera { reply } => {
                self.optical.set_visible(false);
                self.arbiter.deactivate_camera(Instant::now());
                self.publish();
                let _ = reply.send(());
            }
            ArbiterCommand::ClearLast => {
                self.arbiter.clear_last();
                self.publish();
            }
            ArbiterCommand::Shutdown => {}
        }
    }

    fn handle_ble(&mut self, input: BleInput) {
        match input {
            BleInput::Linked { peripheral, reply } => {
                let result = self.arbiter.link_bluetooth(peripheral.clone());
                match &result {
                    Ok(()) => {
                        info!(peripheral = %peripheral, "bluetooth_source_activated");
                        self.publish();
                    }
                    Err(err) => self.reject(SourceKind::BluetoothPeripheral, err),
                }
                let _ = reply.send(result);
            }
            BleInput::Data { peripheral, payload } => {
                match self.arbiter.on_ble_data(&peripheral, &payload) {
                    Intake::Emitted(event) => self.emit(event),
                    Intake::Empty => self.metrics.record_empty_payload(),
                    Intake::Inactive | Intake::Suppressed => {
                        self.metrics.record_inactive_source_dropped();
                        debug!(peripheral = %peripheral, "ble_data_source_inactive");
                    }
                }
            }
            BleInput::Unlinked { peripheral } => {
                self.arbiter.unlink_bluetooth(&peripheral, Instant::now());
                info!(peripheral = %peripheral, phase = %self.arbiter.phase().as_str(), "bluetooth_source_released");
                self.publish();
            }
        }
    }

    fn handle_decode(&mut self, decode: CameraDecode) {
        let queue_delay_us = decode.received_at.elapsed().as_micros() as u64;
        let CameraDecode { symbology, payload, .. } = decode;

        match self.arbiter.on_camera_decode(symbology, &payload, Instant::now()) {
            Intake::Emitted(event) => {
                // close the camera before anyone sees the event
                self.optical.set_visible(false);
                trace!(queue_delay_us = %queue_delay_us, "camera_decode_accepted");
                self.emit(event);
            }
            Intake::Suppressed => {
                self.metrics.record_cooldown_suppressed();
                trace!(payload_len = payload.len(), "camera_decode_in_cooldown");
            }
            Intake::Inactive => {
                self.metrics.record_inactive_source_dropped();
                trace!("camera_decode_source_inactive");
            }
            Intake::Empty => self.metrics.record_empty_payload(),
        }
    }

    fn emit(&mut self, event: ScanEvent) {
        match event.source {
            SourceKind::Camera => self.metrics.record_camera_scan(),
            SourceKind::BluetoothPeripheral => self.metrics.record_ble_scan(),
        }
        info!(
            id = %event.id,
            source = %event.source.as_str(),
            symbology = %event.symbology,
            payload = %event.payload,
            "scan_emitted"
        );
        self.outputs.feedback.scan_succeeded(&event);
        // no subscribers is fine; the snapshot still carries the event
        let _ = self.outputs.event_tx.send(event);
        self.publish();
    }

    fn reject(&self, requested: SourceKind, err: &ScanError) {
        self.metrics.record_activation_rejected();
        warn!(
            requested = %requested.as_str(),
            phase = %self.arbiter.phase().as_str(),
            error = %err,
            "source_activation_rejected"
        );
        if matches!(err, ScanError::SourceBusy(_)) {
            let _ = self.outputs.notice_tx.send(Notice::SourceBusy { requested });
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.arbiter.snapshot());
    }
}

async fn cooldown_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
