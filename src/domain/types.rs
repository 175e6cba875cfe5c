//! Shared value types for the scan coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which acquisition channel produced a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Camera,
    BluetoothPeripheral,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Camera => "camera",
            SourceKind::BluetoothPeripheral => "bluetooth",
        }
    }
}

/// Barcode/QR encoding scheme as reported by the decoder (e.g. "EAN13", "qr")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbology(pub String);

impl Symbology {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Symbology reported for BLE scanners, which deliver already-decoded text
    pub fn ble_text() -> Self {
        Self("ble_text".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical form for comparisons: lowercase, separators removed.
    /// "UPC_A", "upc-a" and "upca" all normalize to "upca".
    pub fn normalized(&self) -> String {
        self.0
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect()
    }

    pub fn matches(&self, other: &Symbology) -> bool {
        self.normalized() == other.normalized()
    }
}

impl std::fmt::Display for Symbology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable hardware identifier of a BLE peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(pub String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single scanned item, immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanEvent {
    /// Time-ordered unique id (UUIDv7)
    pub id: Uuid,
    pub source: SourceKind,
    pub symbology: Symbology,
    pub payload: String,
    /// Peripheral that produced the scan (Bluetooth only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peripheral: Option<PeripheralId>,
    pub timestamp: DateTime<Utc>,
}

impl ScanEvent {
    pub fn camera(symbology: Symbology, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: SourceKind::Camera,
            symbology,
            payload: payload.into(),
            peripheral: None,
            timestamp: Utc::now(),
        }
    }

    pub fn bluetooth(peripheral: PeripheralId, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: SourceKind::BluetoothPeripheral,
            symbology: Symbology::ble_text(),
            payload: payload.into(),
            peripheral: Some(peripheral),
            timestamp: Utc::now(),
        }
    }

    /// Serialize to a single-line JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A peripheral seen during a discovery session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeripheral {
    pub id: PeripheralId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl DiscoveredPeripheral {
    pub fn new(id: PeripheralId, display_name: Option<String>) -> Self {
        Self { id, display_name }
    }

    /// Name to show a user, falling back to the hardware id
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Hardware capability guarded by an OS permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Camera,
    Bluetooth,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Camera => "camera",
            Capability::Bluetooth => "bluetooth",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    #[default]
    Undetermined,
    Granted,
    Denied,
    /// The platform will not prompt again; only a settings change helps
    DeniedPermanently,
}

impl PermissionState {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionState::Granted)
    }

    /// Whether the state is final from the prompt's point of view
    pub fn is_resolved(&self) -> bool {
        matches!(self, PermissionState::Granted | PermissionState::DeniedPermanently)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionState::Undetermined => "undetermined",
            PermissionState::Granted => "granted",
            PermissionState::Denied => "denied",
            PermissionState::DeniedPermanently => "denied_permanently",
        }
    }
}

/// Radio adapter power state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    pub fn is_powered_on(&self) -> bool {
        matches!(self, AdapterState::PoweredOn)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterState::Unknown => "unknown",
            AdapterState::Resetting => "resetting",
            AdapterState::Unsupported => "unsupported",
            AdapterState::Unauthorized => "unauthorized",
            AdapterState::PoweredOff => "powered_off",
            AdapterState::PoweredOn => "powered_on",
        }
    }
}

/// Lifecycle of the single peripheral connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    ServiceDiscovery,
    Subscribing,
    Active,
    Disconnecting,
    Faulted,
}

impl ConnectionState {
    /// Mid-handshake states (a new connect is rejected while in one)
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::ServiceDiscovery
                | ConnectionState::Subscribing
                | ConnectionState::Disconnecting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ServiceDiscovery => "service_discovery",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Active => "active",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Faulted => "faulted",
        }
    }
}

/// Source currently feeding the arbiter
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ActiveSource {
    #[default]
    None,
    Camera,
    Bluetooth { peripheral: PeripheralId },
}

/// User-visible notices for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "notice")]
pub enum Notice {
    /// Physical link dropped while active (not reconnected automatically)
    LinkLost { peripheral: PeripheralId, reason: String },
    /// User-initiated disconnect completed
    Disconnected { peripheral: PeripheralId },
    ConnectionFailed { peripheral: PeripheralId, reason: String },
    /// Permission can only be changed from system settings
    OpenSettings { capability: Capability },
    AdapterUnavailable { state: AdapterState },
    SourceBusy { requested: SourceKind },
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::LinkLost { peripheral, reason } => {
                format!("Scanner {peripheral} disconnected ({reason})")
            }
            Notice::Disconnected { peripheral } => format!("Disconnected from {peripheral}"),
            Notice::ConnectionFailed { peripheral, reason } => {
                format!("Could not connect to {peripheral}: {reason}")
            }
            Notice::OpenSettings { capability } => format!(
                "{} permission is needed to scan items. Please enable it in settings.",
                match capability {
                    Capability::Camera => "Camera",
                    Capability::Bluetooth => "Bluetooth",
                }
            ),
            Notice::AdapterUnavailable { state } => {
                format!("Bluetooth is unavailable (adapter {})", state.as_str())
            }
            Notice::SourceBusy { requested } => {
                format!("Cannot start {} scanning while another source is active", requested.as_str())
            }
        }
    }
}
