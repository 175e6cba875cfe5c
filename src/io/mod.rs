//! IO modules - hardware capability interfaces
//!
//! This module contains the narrow interfaces consumed from the platform:
//! - `ble` - BLE central (adapter state, scan, connect, GATT subscribe)
//! - `camera` - Camera preview and decode callback types
//! - `permissions` - OS permission identifiers and prompts
//! - `feedback` - Scan confirmation feedback
//! - `sim` - In-process simulated hardware for the console and tests

pub mod ble;
pub mod camera;
pub mod feedback;
pub mod permissions;
pub mod sim;

// Re-export commonly used types
pub use ble::{decode_notification, BleCentral, BleError};
pub use camera::{CameraDecode, CameraDevice};
pub use feedback::{LogFeedback, ScanFeedback};
pub use permissions::{PermissionId, PermissionProvider, Platform};
pub use sim::{SimBleCentral, SimCamera, SimPeripheral, SimPermissions};
