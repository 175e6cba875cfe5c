//! OS permission capability
//!
//! Maps each hardware capability onto the platform's permission
//! identifiers. Newer Android splits Bluetooth into scan/connect grants,
//! older releases gate BLE scanning behind fine location.

use crate::domain::types::{Capability, PermissionState};
use crate::infra::config::{Config, PermissionPlatform};
use async_trait::async_trait;
use smallvec::{smallvec, SmallVec};

/// First Android API level with BLUETOOTH_SCAN / BLUETOOTH_CONNECT
const ANDROID_SPLIT_BLUETOOTH_API: u32 = 31;

/// Platform permission identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionId {
    Camera,
    BluetoothScan,
    BluetoothConnect,
    FineLocation,
    /// iOS CoreBluetooth authorization
    Bluetooth,
}

impl PermissionId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionId::Camera => "camera",
            PermissionId::BluetoothScan => "bluetooth_scan",
            PermissionId::BluetoothConnect => "bluetooth_connect",
            PermissionId::FineLocation => "fine_location",
            PermissionId::Bluetooth => "bluetooth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Android { api_level: u32 },
    Ios,
    Desktop,
}

impl Platform {
    pub fn from_config(config: &Config) -> Self {
        match config.platform() {
            PermissionPlatform::Android => Platform::Android { api_level: config.android_api_level() },
            PermissionPlatform::Ios => Platform::Ios,
            PermissionPlatform::Desktop => Platform::Desktop,
        }
    }

    /// Permission identifiers that must all be granted for a capability.
    /// An empty set means the platform does not gate the capability.
    pub fn permissions_for(&self, capability: Capability) -> SmallVec<[PermissionId; 2]> {
        match (self, capability) {
            (Platform::Desktop, _) => SmallVec::new(),
            (_, Capability::Camera) => smallvec![PermissionId::Camera],
            (Platform::Android { api_level }, Capability::Bluetooth)
                if *api_level >= ANDROID_SPLIT_BLUETOOTH_API =>
            {
                smallvec![PermissionId::BluetoothScan, PermissionId::BluetoothConnect]
            }
            (Platform::Android { .. }, Capability::Bluetooth) => {
                smallvec![PermissionId::FineLocation]
            }
            (Platform::Ios, Capability::Bluetooth) => smallvec![PermissionId::Bluetooth],
        }
    }
}

/// Fold per-identifier states into one capability state.
/// Any permanent denial dominates, then denial, then undetermined.
pub fn combine_states<I>(states: I) -> PermissionState
where
    I: IntoIterator<Item = PermissionState>,
{
    let mut combined = PermissionState::Granted;
    for state in states {
        combined = match (combined, state) {
            (PermissionState::DeniedPermanently, _) | (_, PermissionState::DeniedPermanently) => {
                PermissionState::DeniedPermanently
            }
            (PermissionState::Denied, _) | (_, PermissionState::Denied) => PermissionState::Denied,
            (PermissionState::Undetermined, _) | (_, PermissionState::Undetermined) => {
                PermissionState::Undetermined
            }
            _ => PermissionState::Granted,
        };
    }
    combined
}

#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Cached OS state, never prompts
    fn check(&self, id: PermissionId) -> PermissionState;

    /// Prompt the user if the OS allows it; suspends until resolved
    async fn request(&self, id: PermissionId) -> PermissionState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_android_split_permissions() {
        let platform = Platform::Android { api_level: 33 };
        assert_eq!(
            platform.permissions_for(Capability::Bluetooth).as_slice(),
            &[PermissionId::BluetoothScan, PermissionId::BluetoothConnect]
        );
    }

    #[test]
    fn test_android_legacy_location() {
        let platform = Platform::Android { api_level: 29 };
        assert_eq!(
            platform.permissions_for(Capability::Bluetooth).as_slice(),
            &[PermissionId::FineLocation]
        );
        assert_eq!(platform.permissions_for(Capability::Camera).as_slice(), &[PermissionId::Camera]);
    }

    #[test]
    fn test_ios_and_desktop() {
        assert_eq!(
            Platform::Ios.permissions_for(Capability::Bluetooth).as_slice(),
            &[PermissionId::Bluetooth]
        );
        assert!(Platform::Desktop.permissions_for(Capability::Camera).is_empty());
    }

    #[test]
    fn test_combine_states() {
        use PermissionState::*;
        assert_eq!(combine_states(Vec::new()), Granted);
        assert_eq!(combine_states([Granted, Granted]), Granted);
        assert_eq!(combine_states([Granted, Undetermined]), Undetermined);
        assert_eq!(combine_states([Undetermined, Denied]), Denied);
        assert_eq!(combine_states([Denied, DeniedPermanently, Granted]), DeniedPermanently);
    }
}
