//! Services - scanning state machines and coordination
//!
//! This module contains the core components:
//! - `permission_gate` - OS authorization state per capability
//! - `radio` - Adapter exclusivity between discovery and connecting
//! - `discovery` - Time-bounded BLE discovery sessions
//! - `connection` - Single BLE peripheral connection lifecycle
//! - `optical` - Camera visibility and decode intake
//! - `arbiter` - Source exclusivity, cooldown and the last scanned item
//! - `coordinator` - Wiring and the interface for presentation code

pub mod arbiter;
pub mod connection;
pub mod coordinator;
pub mod discovery;
pub mod optical;
pub mod permission_gate;
pub mod radio;

// Re-export commonly used types
pub use arbiter::{ArbiterCommand, ArbiterPhase, ArbiterSnapshot, BleInput, ScanArbiter};
pub use connection::ConnectionManager;
pub use coordinator::{Coordinator, CoordinatorSnapshot, Hardware};
pub use discovery::{DeviceDiscovery, DiscoveryEnd, DiscoverySession, DiscoveryStatus};
pub use optical::OpticalCaptureController;
pub use permission_gate::PermissionGate;
pub use radio::{Radio, RadioClaim, RadioUse};
