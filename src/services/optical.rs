//! Optical capture controller - camera visibility and decode intake
//!
//! `on_decode` is called from the camera stack's callback thread. It never
//! blocks: decodes are forwarded with `try_send` and only while the preview
//! is visible. Duplicate suppression is left to the arbiter.

use crate::domain::types::Symbology;
use crate::infra::metrics::Metrics;
use crate::io::camera::{CameraDecode, CameraDevice};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

pub struct OpticalCaptureController {
    camera: Arc<dyn CameraDevice>,
    visible: AtomicBool,
    visible_tx: watch::Sender<bool>,
    symbologies: Vec<Symbology>,
    decode_tx: mpsc::Sender<CameraDecode>,
    metrics: Arc<Metrics>,
}

impl OpticalCaptureController {
    pub fn new(
        camera: Arc<dyn CameraDevice>,
        symbologies: Vec<Symbology>,
        decode_tx: mpsc::Sender<CameraDecode>,
        metrics: Arc<Metrics>,
    ) -> Self {
        camera.configure_symbologies(&symbologies);
        let (visible_tx, _) = watch::channel(false);
        Self {
            camera,
            visible: AtomicBool::new(false),
            visible_tx,
            symbologies,
            decode_tx,
            metrics,
        }
    }

    /// Show or hide the live preview. Synchronous, never suspends.
    pub fn set_visible(&self, visible: bool) {
        if self.visible.swap(visible, Ordering::SeqCst) == visible {
            return;
        }
        self.camera.set_streaming(visible);
        self.visible_tx.send_replace(visible);
        info!(visible = visible, "camera_visibility");
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.visible_tx.subscribe()
    }

    pub fn symbologies(&self) -> &[Symbology] {
        &self.symbologies
    }

    pub fn is_supported(&self, symbology: &Symbology) -> bool {
        self.symbologies.iter().any(|s| s.matches(symbology))
    }

    /// Decode callback from the camera stack. Returns whether the decode
    /// was queued for the arbiter.
    pub fn on_decode(&self, symbology: Symbology, payload: &str) -> bool {
        if !self.is_visible() {
            self.metrics.record_inactive_source_dropped();
            trace!(symbology = %symbology, "camera_decode_while_hidden");
            return false;
        }
        if !self.is_supported(&symbology) {
            self.metrics.record_unsupported_symbology();
            debug!(symbology = %symbology, "camera_symbology_unsupported");
            return false;
        }
        if payload.is_empty() {
            self.metrics.record_empty_payload();
            debug!(symbology = %symbology, "camera_empty_payload_dropped");
            return false;
        }

        match self.decode_tx.try_send(CameraDecode::new(symbology, payload)) {
            Ok(()) => true,
            Err(TrySendError::Full(decode)) => {
                self.metrics.record_channel_full();
                warn!(symbology = %decode.symbology, "camera_channel_full");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
