//! Coordinator error taxonomy
//!
//! Every variant renders with the device or permission it concerns so a
//! presentation layer can show it verbatim.

use crate::domain::types::{AdapterState, Capability, PeripheralId, SourceKind};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("{0} permission was denied")]
    PermissionDenied(Capability),

    #[error("{0} permission was permanently denied; enable it in system settings")]
    PermissionDeniedPermanently(Capability),

    #[error("Bluetooth adapter is unavailable ({})", .0.as_str())]
    AdapterUnavailable(AdapterState),

    #[error("failed to connect to {peripheral}: {reason}")]
    ConnectionFailed { peripheral: PeripheralId, reason: String },

    #[error("failed to subscribe to scanner data on {peripheral}: {reason}")]
    SubscriptionFailed { peripheral: PeripheralId, reason: String },

    #[error("link to {peripheral} was lost")]
    LinkLost { peripheral: PeripheralId },

    #[error("cannot activate {} source while another source is active", .0.as_str())]
    SourceBusy(SourceKind),

    #[error("a connection to {0} is already active or in progress")]
    ConnectionBusy(PeripheralId),

    #[error("Bluetooth radio is busy ({0})")]
    RadioBusy(&'static str),

    #[error("peripheral {0} was not discovered in the current session")]
    UnknownPeripheral(PeripheralId),

    #[error("no discovery session is running")]
    DiscoveryInactive,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("coordinator is shut down")]
    ShutDown,
}

impl ScanError {
    /// Whether the only recovery is directing the user to system settings
    pub fn needs_settings(&self) -> bool {
        matches!(self, ScanError::PermissionDeniedPermanently(_))
    }

    /// Stable snake_case label for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::PermissionDenied(_) => "permission_denied",
            ScanError::PermissionDeniedPermanently(_) => "permission_denied_permanently",
            ScanError::AdapterUnavailable(_) => "adapter_unavailable",
            ScanError::ConnectionFailed { .. } => "connection_failed",
            ScanError::SubscriptionFailed { .. } => "subscription_failed",
            ScanError::LinkLost { .. } => "link_lost",
            ScanError::SourceBusy(_) => "source_busy",
            ScanError::ConnectionBusy(_) => "connection_busy",
            ScanError::RadioBusy(_) => "radio_busy",
            ScanError::UnknownPeripheral(_) => "unknown_peripheral",
            ScanError::DiscoveryInactive => "discovery_inactive",
            ScanError::Cancelled => "cancelled",
            ScanError::ShutDown => "shut_down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() {
        let err = ScanError::ConnectionFailed {
            peripheral: PeripheralId::new("C4:7F:51:00:12:34"),
            reason: "timed out".to_string(),
        };
        assert_eq!(err.to_string(), "failed to connect to C4:7F:51:00:12:34: timed out");

        let err = ScanError::PermissionDeniedPermanently(Capability::Camera);
        assert!(err.to_string().starts_with("camera permission"));
        assert!(err.needs_settings());
        assert!(!ScanError::PermissionDenied(Capability::Camera).needs_settings());
    }

    #[test]
    fn test_adapter_message() {
        let err = ScanError::AdapterUnavailable(AdapterState::PoweredOff);
        assert_eq!(err.to_string(), "Bluetooth adapter is unavailable (powered_off)");
        assert_eq!(err.kind(), "adapter_unavailable");
    }
}
