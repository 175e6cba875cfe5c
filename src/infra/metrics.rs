//! Lock-free scan metrics and periodic reporting
//!
//! Counters are updated from the arbiter loop, the connection pump and the
//! camera callback thread, so every field is an atomic.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are
//! statistical counters only; never use them for coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

pub struct Metrics {
    /// Scan events emitted from the camera (monotonic)
    camera_scans_total: AtomicU64,
    /// Scan events emitted from BLE peripherals (monotonic)
    ble_scans_total: AtomicU64,
    /// Scans since last report (reset on report)
    scans_since_report: AtomicU64,
    /// Camera decodes dropped inside the cooldown window
    cooldown_suppressed_total: AtomicU64,
    /// Decodes/notifications dropped because their source was not active
    inactive_source_dropped_total: AtomicU64,
    /// Empty payloads discarded (camera and BLE)
    empty_payload_total: AtomicU64,
    /// Camera decodes with a symbology outside the allow-list
    unsupported_symbology_total: AtomicU64,
    /// Activation requests rejected as "source busy"
    activation_rejected_total: AtomicU64,
    connections_established_total: AtomicU64,
    connections_failed_total: AtomicU64,
    link_lost_total: AtomicU64,
    discovery_sessions_total: AtomicU64,
    discovery_timeouts_total: AtomicU64,
    discovery_adapter_aborts_total: AtomicU64,
    /// Inbound channel full, event dropped
    channel_full_dropped_total: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            camera_scans_total: AtomicU64::new(0),
            ble_scans_total: AtomicU64::new(0),
            scans_since_report: AtomicU64::new(0),
            cooldown_suppressed_total: AtomicU64::new(0),
            inactive_source_dropped_total: AtomicU64::new(0),
            empty_payload_total: AtomicU64::new(0),
            unsupported_symbology_total: AtomicU64::new(0),
            activation_rejected_total: AtomicU64::new(0),
            connections_established_total: AtomicU64::new(0),
            connections_failed_total: AtomicU64::new(0),
            link_lost_total: AtomicU64::new(0),
            discovery_sessions_total: AtomicU64::new(0),
            discovery_timeouts_total: AtomicU64::new(0),
            discovery_adapter_aborts_total: AtomicU64::new(0),
            channel_full_dropped_total: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_camera_scan(&self) {
        self.camera_scans_total.fetch_add(1, Ordering::Relaxed);
        self.scans_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ble_scan(&self) {
        self.ble_scans_total.fetch_add(1, Ordering::Relaxed);
        self.scans_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cooldown_suppressed(&self) {
        self.cooldown_suppressed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_inactive_source_dropped(&self) {
        self.inactive_source_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_empty_payload(&self) {
        self.empty_payload_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unsupported_symbology(&self) {
        self.unsupported_symbology_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_activation_rejected(&self) {
        self.activation_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failed(&self) {
        self.connections_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_lost(&self) {
        self.link_lost_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discovery_session(&self) {
        self.discovery_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discovery_timeout(&self) {
        self.discovery_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discovery_adapter_abort(&self) {
        self.discovery_adapter_aborts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_channel_full(&self) {
        self.channel_full_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scans_total(&self) -> u64 {
        self.camera_scans_total.load(Ordering::Relaxed) + self.ble_scans_total.load(Ordering::Relaxed)
    }

    pub fn cooldown_suppressed_total(&self) -> u64 {
        self.cooldown_suppressed_total.load(Ordering::Relaxed)
    }

    pub fn empty_payload_total(&self) -> u64 {
        self.empty_payload_total.load(Ordering::Relaxed)
    }

    pub fn activation_rejected_total(&self) -> u64 {
        self.activation_rejected_total.load(Ordering::Relaxed)
    }

    pub fn link_lost_total(&self) -> u64 {
        self.link_lost_total.load(Ordering::Relaxed)
    }

    /// Snapshot all counters; the per-interval scan count is reset
    pub fn report(&self) -> MetricsSummary {
        let scans_count = self.scans_since_report.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let scans_per_min = if elapsed.as_secs_f64() > 0.0 {
            scans_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            camera_scans_total: self.camera_scans_total.load(Ordering::Relaxed),
            ble_scans_total: self.ble_scans_total.load(Ordering::Relaxed),
            scans_per_min,
            cooldown_suppressed_total: self.cooldown_suppressed_total.load(Ordering::Relaxed),
            inactive_source_dropped_total: self
                .inactive_source_dropped_total
                .load(Ordering::Relaxed),
            empty_payload_total: self.empty_payload_total.load(Ordering::Relaxed),
            unsupported_symbology_total: self.unsupported_symbology_total.load(Ordering::Relaxed),
            activation_rejected_total: self.activation_rejected_total.load(Ordering::Relaxed),
            connections_established_total: self
                .connections_established_total
                .load(Ordering::Relaxed),
            connections_failed_total: self.connections_failed_total.load(Ordering::Relaxed),
            link_lost_total: self.link_lost_total.load(Ordering::Relaxed),
            discovery_sessions_total: self.discovery_sessions_total.load(Ordering::Relaxed),
            discovery_timeouts_total: self.discovery_timeouts_total.load(Ordering::Relaxed),
            discovery_adapter_aborts_total: self
                .discovery_adapter_aborts_total
                .load(Ordering::Relaxed),
            channel_full_dropped_total: self.channel_full_dropped_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub camera_scans_total: u64,
    pub ble_scans_total: u64,
    pub scans_per_min: f64,
    pub cooldown_suppressed_total: u64,
    pub inactive_source_dropped_total: u64,
    pub empty_payload_total: u64,
    pub unsupported_symbology_total: u64,
    pub activation_rejected_total: u64,
    pub connections_established_total: u64,
    pub connections_failed_total: u64,
    pub link_lost_total: u64,
    pub discovery_sessions_total: u64,
    pub discovery_timeouts_total: u64,
    pub discovery_adapter_aborts_total: u64,
    pub channel_full_dropped_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            camera_scans = %self.camera_scans_total,
            ble_scans = %self.ble_scans_total,
            scans_per_min = format!("{:.1}", self.scans_per_min),
            cooldown_suppressed = %self.cooldown_suppressed_total,
            inactive_dropped = %self.inactive_source_dropped_total,
            empty_payloads = %self.empty_payload_total,
            unsupported_symbology = %self.unsupported_symbology_total,
            rejected_activations = %self.activation_rejected_total,
            connections = %self.connections_established_total,
            connection_failures = %self.connections_failed_total,
            link_lost = %self.link_lost_total,
            discovery_sessions = %self.discovery_sessions_total,
            discovery_timeouts = %self.discovery_timeouts_total,
            channel_full_dropped = %self.channel_full_dropped_total,
            "metrics"
        );
    }
}
