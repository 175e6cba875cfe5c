//! Scan arbiter - the single owner of "what was last scanned"
//!
//! `ScanArbiter` is the synchronous state machine: source exclusivity,
//! camera cooldown and the last emitted event. It takes `now` as an
//! argument and performs no I/O. `ArbiterWorker` owns one and feeds it
//! from the command, camera and BLE channels on a single task, so every
//! state mutation happens in one place and concurrent activation requests
//! resolve first-come-first-served.

mod worker;
#[cfg(test)]
mod tests;

pub use worker::{ArbiterInputs, ArbiterOutputs, ArbiterWorker};

use crate::domain::error::ScanError;
use crate::domain::types::{ActiveSource, PeripheralId, ScanEvent, SourceKind, Symbology};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Requests from the coordinator
#[derive(Debug)]
pub enum ArbiterCommand {
    ActivateCamera { reply: oneshot::Sender<Result<(), ScanError>> },
    DeactivateCamera { reply: oneshot::Sender<()> },
    /// Forget the last scanned item
    ClearLast,
    Shutdown,
}

/// Inbound traffic from the connection manager
#[derive(Debug)]
pub enum BleInput {
    /// Connection reached `Active`; the reply says whether Bluetooth may
    /// become the active source
    Linked { peripheral: PeripheralId, reply: oneshot::Sender<Result<(), ScanError>> },
    /// Decoded, trimmed, non-empty notification text
    Data { peripheral: PeripheralId, payload: String },
    Unlinked { peripheral: PeripheralId },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ArbiterPhase {
    #[default]
    Idle,
    CameraActive,
    BluetoothActive { peripheral: PeripheralId },
    /// Camera closed after an emission; decodes dropped until the deadline
    Cooldown,
}

impl ArbiterPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArbiterPhase::Idle => "idle",
            ArbiterPhase::CameraActive => "camera_active",
            ArbiterPhase::BluetoothActive { .. } => "bluetooth_active",
            ArbiterPhase::Cooldown => "cooldown",
        }
    }
}

/// Result of offering one raw scan to the arbiter
#[derive(Debug, Clone, PartialEq)]
pub enum Intake {
    Emitted(ScanEvent),
    /// Camera decode inside the cooldown window
    Suppressed,
    /// The producing source is not the active one
    Inactive,
    Empty,
}

#[derive(Debug, Clone, Default)]
pub struct ArbiterSnapshot {
    pub phase: ArbiterPhase,
    pub active_source: ActiveSource,
    pub last_event: Option<ScanEvent>,
    pub cooldown_until: Option<Instant>,
}

#[derive(Debug)]
pub struct ScanArbiter {
    phase: ArbiterPhase,
    last_event: Option<ScanEvent>,
    cooldown_until: Option<Instant>,
    cooldown: Duration,
}

impl ScanArbiter {
    pub fn new(cooldown: Duration) -> Self {
        Self { phase: ArbiterPhase::Idle, last_event: None, cooldown_until: None, cooldown }
    }

    pub fn phase(&self) -> &ArbiterPhase {
        &self.phase
    }

    pub fn last_event(&self) -> Option<&ScanEvent> {
        self.last_event.as_ref()
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    pub fn active_source(&self) -> ActiveSource {
        match &self.phase {
            ArbiterPhase::CameraActive => ActiveSource::Camera,
            ArbiterPhase::BluetoothActive { peripheral } => {
                ActiveSource::Bluetooth { peripheral: peripheral.clone() }
            }
            ArbiterPhase::Idle | ArbiterPhase::Cooldown => ActiveSource::None,
        }
    }

    /// Camera may open unless Bluetooth is the active source. Opening starts
    /// a fresh session with no last item; an unexpired cooldown still holds.
    pub fn activate_camera(&mut self) -> Result<(), ScanError> {
        match self.phase {
            ArbiterPhase::BluetoothActive { .. } => Err(ScanError::SourceBusy(SourceKind::Camera)),
            ArbiterPhase::CameraActive => Ok(()),
            ArbiterPhase::Idle | ArbiterPhase::Cooldown => {
                self.phase = ArbiterPhase::CameraActive;
                self.last_event = None;
                Ok(())
            }
        }
    }

    pub fn deactivate_camera(&mut self, now: Instant) {
        if self.phase == ArbiterPhase::CameraActive {
            self.settle(now);
        }
    }

    /// Bluetooth may become active unless the camera is open
    pub fn link_bluetooth(&mut self, peripheral: PeripheralId) -> Result<(), ScanError> {
        match &self.phase {
            ArbiterPhase::CameraActive => {
                Err(ScanError::SourceBusy(SourceKind::BluetoothPeripheral))
            }
            ArbiterPhase::BluetoothActive { peripheral: current } if *current == peripheral => Ok(()),
            ArbiterPhase::BluetoothActive { peripheral: current } => {
                Err(ScanError::ConnectionBusy(current.clone()))
            }
            ArbiterPhase::Idle | ArbiterPhase::Cooldown => {
                self.phase = ArbiterPhase::BluetoothActive { peripheral };
                Ok(())
            }
        }
    }

    pub fn unlink_bluetooth(&mut self, peripheral: &PeripheralId, now: Instant) {
        if matches!(&self.phase, ArbiterPhase::BluetoothActive { peripheral: p } if p == peripheral) {
            self.settle(now);
        }
    }

    /// Camera decode: at most one emission per cooldown window, after which
    /// the camera source is closed
    pub fn on_camera_decode(&mut self, symbology: Symbology, payload: &str, now: Instant) -> Intake {
        let cooling = self.cooldown_until.is_some_and(|until| now < until);
        match self.phase {
            // frames still queued from the emitting session land here
            ArbiterPhase::Cooldown if cooling => return Intake::Suppressed,
            ArbiterPhase::CameraActive if cooling => return Intake::Suppressed,
            ArbiterPhase::CameraActive => {}
            ArbiterPhase::Idle | ArbiterPhase::Cooldown | ArbiterPhase::BluetoothActive { .. } => {
                return Intake::Inactive;
            }
        }
        if payload.is_empty() {
            return Intake::Empty;
        }

        let event = ScanEvent::camera(symbology, payload);
        self.last_event = Some(event.clone());
        self.cooldown_until = Some(now + self.cooldown);
        self.phase = ArbiterPhase::Cooldown;
        Intake::Emitted(event)
    }

    /// BLE notification text: every non-empty payload from the linked
    /// peripheral is emitted, no cooldown
    pub fn on_ble_data(&mut self, peripheral: &PeripheralId, payload: &str) -> Intake {
        if !matches!(&self.phase, ArbiterPhase::BluetoothActive { peripheral: p } if p == peripheral) {
            return Intake::Inactive;
        }
        if payload.trim().is_empty() {
            return Intake::Empty;
        }
        let event = ScanEvent::bluetooth(peripheral.clone(), payload);
        self.last_event = Some(event.clone());
        Intake::Emitted(event)
    }

    /// Clear an elapsed cooldown. Returns true if anything changed.
    pub fn expire_cooldown(&mut self, now: Instant) -> bool {
        match self.cooldown_until {
            Some(until) if now >= until => {
                self.cooldown_until = None;
                if self.phase == ArbiterPhase::Cooldown {
                    self.phase = ArbiterPhase::Idle;
                }
                true
            }
            _ => false,
        }
    }

    pub fn clear_last(&mut self) {
        self.last_event = None;
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        ArbiterSnapshot {
            phase: self.phase.clone(),
            active_source: self.active_source(),
            last_event: self.last_event.clone(),
            cooldown_until: self.cooldown_until,
        }
    }

    /// Phase to fall back to when the active source goes away
    fn settle(&mut self, now: Instant) {
        self.phase = match self.cooldown_until {
            Some(until) if now < until => ArbiterPhase::Cooldown,
            _ => {
                self.cooldown_until = None;
                ArbiterPhase::Idle
            }
        };
    }
}
