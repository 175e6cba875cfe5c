//! Scan coordinator library
//!
//! Merges camera barcode decodes and BLE scanner notifications into one
//! stream of scan events. Exposes modules for integration testing and
//! binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
