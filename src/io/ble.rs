//! BLE central capability
//!
//! The narrow interface the coordinator consumes from the platform radio
//! stack. Release operations (`stop_scan`, `unsubscribe`, `cancel_connect`,
//! `disconnect`) are synchronous so they can run from `Drop` and on every
//! exit path without an executor.

use crate::domain::types::{AdapterState, PeripheralId};
use crate::infra::config::PayloadEncoding;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Radio-level failure reported by the platform stack
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error("adapter is {}", .0.as_str())]
    AdapterNotReady(AdapterState),
    #[error("scan could not be started: {0}")]
    ScanFailed(String),
    #[error("peripheral not reachable")]
    NotReachable,
    #[error("connection timed out")]
    Timeout,
    #[error("GATT error: {0}")]
    Gatt(String),
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("link closed")]
    LinkClosed,
}

/// Advertisement filter for discovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services (empty = all)
    pub services: Vec<Uuid>,
    /// Report every advertisement packet rather than one per peripheral
    pub allow_duplicates: bool,
}

/// One advertisement packet seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: PeripheralId,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
}

/// GATT service as returned by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl GattService {
    pub fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.characteristics.contains(&uuid)
    }
}

/// Platform handle to an established link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandle {
    pub peripheral: PeripheralId,
    /// Platform connection token; unique per connect call
    pub token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Characteristic notification stream. The receiver closes when the
/// physical link drops.
#[derive(Debug)]
pub struct Notifications {
    pub id: SubscriptionId,
    pub rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Observe adapter power state; the receiver always holds the latest value
    fn adapter_state(&self) -> watch::Receiver<AdapterState>;

    /// Start scanning. Dropping the receiver does not stop the radio;
    /// call `stop_scan`.
    async fn start_scan(&self, filter: ScanFilter) -> Result<mpsc::Receiver<Advertisement>, BleError>;

    fn stop_scan(&self);

    async fn connect(&self, peripheral: &PeripheralId) -> Result<LinkHandle, BleError>;

    /// Abort an in-flight `connect` for the peripheral
    fn cancel_connect(&self, peripheral: &PeripheralId);

    async fn discover_services(&self, link: &LinkHandle) -> Result<Vec<GattService>, BleError>;

    async fn subscribe(
        &self,
        link: &LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Notifications, BleError>;

    fn unsubscribe(&self, link: &LinkHandle, subscription: SubscriptionId);

    fn disconnect(&self, link: &LinkHandle);
}

/// Decode a characteristic notification to trimmed text.
/// Returns `None` when nothing but whitespace remains.
pub fn decode_notification(raw: &[u8], encoding: PayloadEncoding) -> Option<String> {
    let text = match encoding {
        PayloadEncoding::Utf8 => String::from_utf8_lossy(raw).into_owned(),
        PayloadEncoding::Base64 => {
            let trimmed = trim_ascii(raw);
            match STANDARD.decode(trimmed) {
                Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
                Err(e) => {
                    tracing::debug!(error = %e, raw = %hex::encode(raw), "ble_base64_decode_failed");
                    return None;
                }
            }
        }
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn trim_ascii(raw: &[u8]) -> &[u8] {
    let start = raw.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(raw.len());
    let end = raw.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &raw[start..end]
}
