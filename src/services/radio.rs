//! Adapter exclusivity lease
//!
//! Discovery scans and connection handshakes must not run against the
//! adapter at the same time. Each holds a `RadioClaim` for its duration;
//! the claim frees the radio when dropped, on every exit path.

use crate::domain::error::ScanError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioUse {
    Idle,
    Discovering,
    Connecting,
}

impl RadioUse {
    pub fn as_str(&self) -> &'static str {
        match self {
            RadioUse::Idle => "idle",
            RadioUse::Discovering => "discovery in progress",
            RadioUse::Connecting => "connection attempt in progress",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Radio {
    current: Arc<Mutex<RadioUse>>,
}

impl Default for Radio {
    fn default() -> Self {
        Self::new()
    }
}

impl Radio {
    pub fn new() -> Self {
        Self { current: Arc::new(Mutex::new(RadioUse::Idle)) }
    }

    /// Take the radio for `usage`, or report what already holds it
    pub fn try_claim(&self, usage: RadioUse) -> Result<RadioClaim, ScanError> {
        let mut current = self.current.lock();
        if *current != RadioUse::Idle {
            debug!(held_by = %current.as_str(), wanted = %usage.as_str(), "radio_busy");
            return Err(ScanError::RadioBusy(current.as_str()));
        }
        *current = usage;
        Ok(RadioClaim { radio: self.clone(), usage })
    }

    pub fn current(&self) -> RadioUse {
        *self.current.lock()
    }
}

#[derive(Debug)]
pub struct RadioClaim {
    radio: Radio,
    usage: RadioUse,
}

impl RadioClaim {
    pub fn usage(&self) -> RadioUse {
        self.usage
    }
}

impl Drop for RadioClaim {
    fn drop(&mut self) {
        let mut current = self.radio.current.lock();
        if *current == self.usage {
            *current = RadioUse::Idle;
        }
    }
}
