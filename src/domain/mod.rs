//! Domain models - value types shared by every component
//!
//! - `ScanEvent` - the unified, immutable scanned-item record
//! - `PermissionState`, `AdapterState`, `ConnectionState` - observable states
//! - `ScanError` - coordinator error taxonomy
//! - `Notice` - user-visible notices for the presentation layer

pub mod error;
pub mod types;

pub use error::ScanError;
pub use types::{
    ActiveSource, AdapterState, Capability, ConnectionState, DiscoveredPeripheral, Notice,
    PeripheralId, PermissionState, ScanEvent, SourceKind, Symbology,
};
