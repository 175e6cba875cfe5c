//! Infrastructure - configuration, logging and metrics
//!
//! - `config` - Application configuration (TOML loading, defaults)
//! - `logging` - tracing subscriber setup
//! - `metrics` - Lock-free scan counters

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{Config, PayloadEncoding, PermissionPlatform};
pub use logging::init_logging;
pub use metrics::{Metrics, MetricsSummary};
