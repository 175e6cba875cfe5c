//! Camera capability
//!
//! The camera stack decodes symbols itself and calls back with
//! `(symbology, payload)`. The coordinator only switches the live preview
//! on and off and tells the decoder which symbologies to look for.

use crate::domain::types::Symbology;
use std::time::Instant;

/// Raw decode callback from the camera subsystem
#[derive(Debug, Clone)]
pub struct CameraDecode {
    pub symbology: Symbology,
    pub payload: String,
    /// When the callback fired (for queue delay logging)
    pub received_at: Instant,
}

impl CameraDecode {
    pub fn new(symbology: Symbology, payload: impl Into<String>) -> Self {
        Self { symbology, payload: payload.into(), received_at: Instant::now() }
    }
}

pub trait CameraDevice: Send + Sync {
    /// Start or stop the live preview and decoder
    fn set_streaming(&self, active: bool);

    /// Restrict the decoder to these symbologies
    fn configure_symbologies(&self, symbologies: &[Symbology]);
}
