//! Device discovery - time-bounded BLE scan sessions
//!
//! A session is lazy: the radio scan starts on the first call to
//! `DiscoverySession::next`. It ends on timeout, cancel, selection, adapter
//! loss or scan failure, and on every one of those paths the scan is
//! stopped, the radio lease released and the discovered set cleared.

use crate::domain::error::ScanError;
use crate::domain::types::{AdapterState, DiscoveredPeripheral, PeripheralId};
use crate::infra::metrics::Metrics;
use crate::io::ble::{Advertisement, BleCentral, ScanFilter};
use crate::services::radio::{Radio, RadioClaim, RadioUse};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Why a discovery session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEnd {
    TimedOut,
    Cancelled,
    Selected(DiscoveredPeripheral),
    AdapterUnavailable(AdapterState),
    ScanFailed(String),
}

impl DiscoveryEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryEnd::TimedOut => "timed_out",
            DiscoveryEnd::Cancelled => "cancelled",
            DiscoveryEnd::Selected(_) => "selected",
            DiscoveryEnd::AdapterUnavailable(_) => "adapter_unavailable",
            DiscoveryEnd::ScanFailed(_) => "scan_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DiscoveryStatus {
    #[default]
    Idle,
    Scanning,
    Ended(DiscoveryEnd),
}

impl DiscoveryStatus {
    pub fn is_scanning(&self) -> bool {
        matches!(self, DiscoveryStatus::Scanning)
    }
}

/// Request to end the running session from outside
#[derive(Debug, Clone)]
enum StopRequest {
    Cancel,
    Select(DiscoveredPeripheral),
}

struct SessionControl {
    id: u64,
    stop_tx: watch::Sender<Option<StopRequest>>,
}

pub struct DeviceDiscovery {
    ble: Arc<dyn BleCentral>,
    radio: Radio,
    filter: ScanFilter,
    metrics: Arc<Metrics>,
    discovered_tx: watch::Sender<Vec<DiscoveredPeripheral>>,
    status_tx: watch::Sender<DiscoveryStatus>,
    control: Arc<Mutex<Option<SessionControl>>>,
    next_session_id: Mutex<u64>,
}

impl DeviceDiscovery {
    pub fn new(
        ble: Arc<dyn BleCentral>,
        radio: Radio,
        filter: ScanFilter,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (discovered_tx, _) = watch::channel(Vec::new());
        let (status_tx, _) = watch::channel(DiscoveryStatus::Idle);
        Self {
            ble,
            radio,
            filter,
            metrics,
            discovered_tx,
            status_tx,
            control: Arc::new(Mutex::new(None)),
            next_session_id: Mutex::new(0),
        }
    }

    /// Open a session bounded by `timeout`. The adapter must be powered on
    /// and the radio free of connection attempts.
    pub fn start_session(&self, timeout: Duration) -> Result<DiscoverySession, ScanError> {
        let adapter = *self.ble.adapter_state().borrow();
        if !adapter.is_powered_on() {
            warn!(adapter = %adapter.as_str(), "discovery_adapter_unavailable");
            return Err(ScanError::AdapterUnavailable(adapter));
        }
        let claim = self.radio.try_claim(RadioUse::Discovering)?;

        let id = {
            let mut next = self.next_session_id.lock();
            *next += 1;
            *next
        };
        let (stop_tx, stop_rx) = watch::channel(None);
        *self.control.lock() = Some(SessionControl { id, stop_tx });

        self.discovered_tx.send_replace(Vec::new());
        self.metrics.record_discovery_session();
        info!(session = id, timeout_ms = %timeout.as_millis(), "discovery_session_opened");

        Ok(DiscoverySession {
            id,
            ble: self.ble.clone(),
            filter: self.filter.clone(),
            timeout,
            deadline: None,
            adv_rx: None,
            stop_rx,
            adapter_rx: self.ble.adapter_state(),
            seen: FxHashSet::default(),
            discovered_tx: self.discovered_tx.clone(),
            status_tx: self.status_tx.clone(),
            control: self.control.clone(),
            metrics: self.metrics.clone(),
            claim: Some(claim),
            ended: None,
        })
    }

    /// End the running session. No-op success when none is running.
    pub fn cancel(&self) {
        if let Some(control) = self.control.lock().as_ref() {
            control.stop_tx.send_replace(Some(StopRequest::Cancel));
        }
    }

    /// Pick a peripheral from the running session; ends the session
    pub fn select_peripheral(&self, id: &PeripheralId) -> Result<DiscoveredPeripheral, ScanError> {
        let control = self.control.lock();
        let Some(control) = control.as_ref() else {
            return Err(ScanError::DiscoveryInactive);
        };
        let peripheral = self
            .discovered_tx
            .borrow()
            .iter()
            .find(|p| &p.id == id)
            .cloned()
            .ok_or_else(|| ScanError::UnknownPeripheral(id.clone()))?;
        control.stop_tx.send_replace(Some(StopRequest::Select(peripheral.clone())));
        Ok(peripheral)
    }

    pub fn is_active(&self) -> bool {
        self.control.lock().is_some()
    }

    pub fn discovered(&self) -> Vec<DiscoveredPeripheral> {
        self.discovered_tx.borrow().clone()
    }

    pub fn watch_discovered(&self) -> watch::Receiver<Vec<DiscoveredPeripheral>> {
        self.discovered_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<DiscoveryStatus> {
        self.status_tx.subscribe()
    }

    /// Suspend until the adapter reports powered on
    pub async fn wait_for_adapter(&self) -> Result<(), ScanError> {
        let mut rx = self.ble.adapter_state();
        let powered = rx.wait_for(AdapterState::is_powered_on).await.is_ok();
        if powered {
            Ok(())
        } else {
            Err(ScanError::ShutDown)
        }
    }
}

enum Step {
    Advertisement(Option<Advertisement>),
    Stop(StopRequest),
    Adapter(AdapterState),
    Deadline,
}

pub struct DiscoverySession {
    id: u64,
    ble: Arc<dyn BleCentral>,
    filter: ScanFilter,
    timeout: Duration,
    deadline: Option<Instant>,
    adv_rx: Option<mpsc::Receiver<Advertisement>>,
    stop_rx: watch::Receiver<Option<StopRequest>>,
    adapter_rx: watch::Receiver<AdapterState>,
    seen: FxHashSet<PeripheralId>,
    discovered_tx: watch::Sender<Vec<DiscoveredPeripheral>>,
    status_tx: watch::Sender<DiscoveryStatus>,
    control: Arc<Mutex<Option<SessionControl>>>,
    metrics: Arc<Metrics>,
    claim: Option<RadioClaim>,
    ended: Option<DiscoveryEnd>,
}

impl DiscoverySession {
    /// Next newly discovered peripheral (first-seen order, one per id), or
    /// `None` once the session has ended
    pub async fn next(&mut self) -> Option<DiscoveredPeripheral> {
        if self.ended.is_some() {
            return None;
        }

        let pending_stop = self.stop_rx.borrow_and_update().clone();
        if let Some(stop) = pending_stop {
            self.finish_with_request(stop);
            return None;
        }

        if self.adv_rx.is_none() && !self.start_scan().await {
            return None;
        }

        loop {
            let step = {
                let (Some(adv_rx), Some(deadline)) = (self.adv_rx.as_mut(), self.deadline) else {
                    return None;
                };
                let stop_rx = &mut self.stop_rx;
                let adapter_rx = &mut self.adapter_rx;
                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => match changed {
                        Ok(()) => match stop_rx.borrow_and_update().clone() {
                            Some(stop) => Step::Stop(stop),
                            None => continue,
                        },
                        // owning DeviceDiscovery dropped
                        Err(_) => Step::Stop(StopRequest::Cancel),
                    },
                    changed = adapter_rx.changed() => match changed {
                        Ok(()) => Step::Adapter(*adapter_rx.borrow_and_update()),
                        Err(_) => Step::Adapter(AdapterState::Unknown),
                    },
                    _ = sleep_until(deadline) => Step::Deadline,
                    adv = adv_rx.recv() => Step::Advertisement(adv),
                }
            };

            match step {
                Step::Stop(stop) => {
                    self.finish_with_request(stop);
                    return None;
                }
                Step::Adapter(state) if state.is_powered_on() => continue,
                Step::Adapter(state) => {
                    self.finish(DiscoveryEnd::AdapterUnavailable(state));
                    return None;
                }
                Step::Deadline => {
                    self.finish(DiscoveryEnd::TimedOut);
                    return None;
                }
                Step::Advertisement(None) => {
                    let adapter = *self.adapter_rx.borrow();
                    let end = if adapter.is_powered_on() {
                        DiscoveryEnd::ScanFailed("scan stream closed".to_string())
                    } else {
                        DiscoveryEnd::AdapterUnavailable(adapter)
                    };
                    self.finish(end);
                    return None;
                }
                Step::Advertisement(Some(adv)) => {
                    if let Some(peripheral) = self.record(adv) {
                        return Some(peripheral);
                    }
                }
            }
        }
    }

    /// Drive the session to its end, returning how it ended
    pub async fn run_to_end(&mut self) -> DiscoveryEnd {
        while self.next().await.is_some() {}
        self.ended.clone().unwrap_or(DiscoveryEnd::Cancelled)
    }

    pub fn end(&self) -> Option<&DiscoveryEnd> {
        self.ended.as_ref()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    async fn start_scan(&mut self) -> bool {
        let adapter = *self.adapter_rx.borrow_and_update();
        if !adapter.is_powered_on() {
            self.finish(DiscoveryEnd::AdapterUnavailable(adapter));
            return false;
        }
        match self.ble.start_scan(self.filter.clone()).await {
            Ok(rx) => {
                self.adv_rx = Some(rx);
                self.deadline = Some(Instant::now() + self.timeout);
                self.status_tx.send_replace(DiscoveryStatus::Scanning);
                info!(session = self.id, "discovery_scan_started");
                true
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "discovery_scan_failed");
                self.finish(DiscoveryEnd::ScanFailed(e.to_string()));
                false
            }
        }
    }

    /// Add an advertisement to the set; `Some` only the first time an id is seen
    fn record(&mut self, adv: Advertisement) -> Option<DiscoveredPeripheral> {
        if !self.seen.insert(adv.id.clone()) {
            // a later packet may carry the name the first one lacked
            if let Some(name) = adv.local_name {
                self.discovered_tx.send_if_modified(|list| {
                    match list.iter_mut().find(|p| p.id == adv.id && p.display_name.is_none()) {
                        Some(p) => {
                            p.display_name = Some(name);
                            true
                        }
                        None => false,
                    }
                });
            }
            return None;
        }

        let peripheral = DiscoveredPeripheral::new(adv.id, adv.local_name);
        debug!(
            session = self.id,
            peripheral = %peripheral.id,
            name = %peripheral.label(),
            rssi = ?adv.rssi,
            "peripheral_discovered"
        );
        self.discovered_tx.send_modify(|list| list.push(peripheral.clone()));
        Some(peripheral)
    }

    fn finish_with_request(&mut self, stop: StopRequest) {
        match stop {
            StopRequest::Cancel => self.finish(DiscoveryEnd::Cancelled),
            StopRequest::Select(peripheral) => self.finish(DiscoveryEnd::Selected(peripheral)),
        }
    }

    fn finish(&mut self, end: DiscoveryEnd) {
        if self.ended.is_some() {
            return;
        }
        if self.adv_rx.take().is_some() {
            self.ble.stop_scan();
        }
        self.discovered_tx.send_replace(Vec::new());
        self.claim = None;

        {
            let mut control = self.control.lock();
            if control.as_ref().is_some_and(|c| c.id == self.id) {
                *control = None;
            }
        }

        match &end {
            DiscoveryEnd::TimedOut => self.metrics.record_discovery_timeout(),
            DiscoveryEnd::AdapterUnavailable(_) => self.metrics.record_discovery_adapter_abort(),
            _ => {}
        }
        info!(
            session = self.id,
            reason = %end.as_str(),
            found = self.seen.len(),
            "discovery_session_ended"
        );
        self.status_tx.send_replace(DiscoveryStatus::Ended(end.clone()));
        self.ended = Some(end);
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        self.finish(DiscoveryEnd::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::sim::{SimBleCentral, SimPeripheral};
    use uuid::Uuid;

    const SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
    const CHAR: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

    fn setup() -> (Arc<SimBleCentral>, Radio, DeviceDiscovery) {
        let sim = Arc::new(SimBleCentral::default());
        let radio = Radio::new();
        let filter = ScanFilter { services: vec![SERVICE], allow_duplicates: false };
        let discovery =
            DeviceDiscovery::new(sim.clone(), radio.clone(), filter, Arc::new(Metrics::new()));
        (sim, radio, discovery)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_no_peripherals() {
        let (sim, radio, discovery) = setup();
        let started = Instant::now();
        let mut session = discovery.start_session(Duration::from_millis(15_000)).unwrap();

        assert_eq!(session.next().await, None);
        assert_eq!(session.end(), Some(&DiscoveryEnd::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(15_000));
        assert!(discovery.discovered().is_empty());
        assert!(!discovery.is_active());
        assert!(!sim.is_scanning());
        assert_eq!(radio.current(), RadioUse::Idle);
        assert_eq!(
            *discovery.status().borrow(),
            DiscoveryStatus::Ended(DiscoveryEnd::TimedOut)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedupe_first_seen_order() {
        let (sim, _radio, discovery) = setup();
        sim.add_peripheral(SimPeripheral::scanner("AA", Some("Zebra"), SERVICE, CHAR));
        let mut session = discovery.start_session(Duration::from_secs(15)).unwrap();

        let first = session.next().await.unwrap();
        assert_eq!(first.id, PeripheralId::new("AA"));

        sim.add_peripheral(SimPeripheral::scanner("BB", None, SERVICE, CHAR));
        sim.advertise(&PeripheralId::new("AA"));
        let second = session.next().await.unwrap();
        assert_eq!(second.id, PeripheralId::new("BB"));

        let ids: Vec<_> = discovery.discovered().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PeripheralId::new("AA"), PeripheralId::new("BB")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_is_lazy() {
        let (sim, _radio, discovery) = setup();
        let mut session = discovery.start_session(Duration::from_secs(1)).unwrap();
        assert!(!sim.is_scanning());
        discovery.cancel();
        assert_eq!(session.next().await, None);
        assert_eq!(session.end(), Some(&DiscoveryEnd::Cancelled));
        assert_eq!(sim.calls().scans_started.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_off_aborts_and_clears() {
        let (sim, radio, discovery) = setup();
        sim.add_peripheral(SimPeripheral::scanner("AA", None, SERVICE, CHAR));
        let mut session = discovery.start_session(Duration::from_secs(15)).unwrap();
        assert!(session.next().await.is_some());
        assert_eq!(discovery.discovered().len(), 1);

        sim.set_adapter_state(AdapterState::PoweredOff);
        assert_eq!(session.next().await, None);
        assert_eq!(
            session.end(),
            Some(&DiscoveryEnd::AdapterUnavailable(AdapterState::PoweredOff))
        );
        assert!(discovery.discovered().is_empty());
        assert_eq!(radio.current(), RadioUse::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_requires_powered_adapter() {
        let (sim, _radio, discovery) = setup();
        sim.set_adapter_state(AdapterState::PoweredOff);
        let err = discovery.start_session(Duration::from_secs(15)).err().unwrap();
        assert_eq!(err, ScanError::AdapterUnavailable(AdapterState::PoweredOff));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_while_connecting() {
        let (_sim, radio, discovery) = setup();
        let _claim = radio.try_claim(RadioUse::Connecting).unwrap();
        let err = discovery.start_session(Duration::from_secs(15)).err().unwrap();
        assert_eq!(err, ScanError::RadioBusy("connection attempt in progress"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_ends_session() {
        let (sim, _radio, discovery) = setup();
        sim.add_peripheral(SimPeripheral::scanner("AA", Some("Zebra"), SERVICE, CHAR));
        let mut session = discovery.start_session(Duration::from_secs(15)).unwrap();
        session.next().await.unwrap();

        let missing = discovery.select_peripheral(&PeripheralId::new("ZZ"));
        assert_eq!(missing, Err(ScanError::UnknownPeripheral(PeripheralId::new("ZZ"))));

        let chosen = discovery.select_peripheral(&PeripheralId::new("AA")).unwrap();
        assert_eq!(chosen.label(), "Zebra");
        assert_eq!(session.next().await, None);
        assert!(matches!(session.end(), Some(DiscoveryEnd::Selected(p)) if p.id == chosen.id));
        assert!(!sim.is_scanning());
        assert_eq!(discovery.select_peripheral(&chosen.id), Err(ScanError::DiscoveryInactive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_scan() {
        let (sim, radio, discovery) = setup();
        sim.add_peripheral(SimPeripheral::scanner("AA", None, SERVICE, CHAR));
        {
            let mut session = discovery.start_session(Duration::from_secs(15)).unwrap();
            session.next().await.unwrap();
            assert!(sim.is_scanning());
        }
        assert!(!sim.is_scanning());
        assert_eq!(radio.current(), RadioUse::Idle);
        assert!(discovery.discovered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_restartable() {
        let (_sim, _radio, discovery) = setup();
        let mut first = discovery.start_session(Duration::from_millis(100)).unwrap();
        assert_eq!(first.run_to_end().await, DiscoveryEnd::TimedOut);
        let mut second = discovery.start_session(Duration::from_millis(100)).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(second.run_to_end().await, DiscoveryEnd::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_adapter() {
        let (sim, _radio, discovery) = setup();
        sim.set_adapter_state(AdapterState::PoweredOff);
        let sim2 = sim.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            sim2.set_adapter_state(AdapterState::PoweredOn);
        });
        assert_eq!(discovery.wait_for_adapter().await, Ok(()));
    }
}
