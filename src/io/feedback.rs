//! Scan confirmation feedback (haptic/audible on devices)

use crate::domain::types::ScanEvent;
use tracing::info;

pub trait ScanFeedback: Send + Sync {
    fn scan_succeeded(&self, event: &ScanEvent);
}

/// Default feedback: a structured log line per accepted scan
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFeedback;

impl ScanFeedback for LogFeedback {
    fn scan_succeeded(&self, event: &ScanEvent) {
        info!(
            source = %event.source.as_str(),
            symbology = %event.symbology,
            payload_len = %event.payload.len(),
            "scan_feedback"
        );
    }
}
