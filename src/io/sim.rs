//! In-process simulated hardware
//!
//! Stand-ins for the BLE radio, OS permission prompts and the camera so the
//! coordinator can run without devices: the console binary drives them from
//! stdin and the test suites script them directly. Every release call is
//! counted so teardown order can be asserted.

use crate::domain::types::{AdapterState, PeripheralId, PermissionState, Symbology};
use crate::io::ble::{
    Advertisement, BleCentral, BleError, GattService, LinkHandle, Notifications, ScanFilter,
    SubscriptionId,
};
use crate::io::camera::CameraDevice;
use crate::io::permissions::{PermissionId, PermissionProvider};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

const SIM_CHANNEL_CAPACITY: usize = 64;

/// A peripheral in radio range
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub services: Vec<GattService>,
}

impl SimPeripheral {
    /// Peripheral exposing one notify characteristic on one service
    pub fn scanner(id: &str, name: Option<&str>, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            id: PeripheralId::new(id),
            name: name.map(str::to_string),
            services: vec![GattService { uuid: service, characteristics: vec![characteristic] }],
        }
    }

    fn matches(&self, filter: &ScanFilter) -> bool {
        filter.services.is_empty()
            || self.services.iter().any(|s| filter.services.contains(&s.uuid))
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement { id: self.id.clone(), local_name: self.name.clone(), rssi: Some(-60) }
    }
}

#[derive(Debug)]
struct SimLink {
    peripheral: PeripheralId,
    subscriptions: Vec<(SubscriptionId, mpsc::Sender<Bytes>)>,
}

#[derive(Debug, Default)]
struct SimBleState {
    in_range: Vec<SimPeripheral>,
    scan: Option<(ScanFilter, mpsc::Sender<Advertisement>)>,
    links: FxHashMap<u64, SimLink>,
    pending_connects: Vec<PeripheralId>,
    fail_connect: Option<BleError>,
    fail_discovery: Option<BleError>,
    fail_subscribe: Option<BleError>,
}

/// Counters of calls made against the simulated radio
#[derive(Debug, Default)]
pub struct SimBleCalls {
    pub scans_started: AtomicU64,
    pub scans_stopped: AtomicU64,
    pub connects: AtomicU64,
    pub connects_cancelled: AtomicU64,
    pub subscriptions: AtomicU64,
    pub unsubscribes: AtomicU64,
    pub disconnects: AtomicU64,
}

pub struct SimBleCentral {
    state: Mutex<SimBleState>,
    adapter_tx: watch::Sender<AdapterState>,
    hold_connects: watch::Sender<bool>,
    next_token: AtomicU64,
    calls: SimBleCalls,
}

impl Default for SimBleCentral {
    fn default() -> Self {
        Self::new(AdapterState::PoweredOn)
    }
}

impl SimBleCentral {
    pub fn new(initial: AdapterState) -> Self {
        let (adapter_tx, _) = watch::channel(initial);
        let (hold_connects, _) = watch::channel(false);
        Self {
            state: Mutex::new(SimBleState::default()),
            adapter_tx,
            hold_connects,
            next_token: AtomicU64::new(1),
            calls: SimBleCalls::default(),
        }
    }

    pub fn calls(&self) -> &SimBleCalls {
        &self.calls
    }

    /// Change adapter power; powering off ends scans and drops every link
    pub fn set_adapter_state(&self, adapter: AdapterState) {
        if !adapter.is_powered_on() {
            let mut state = self.state.lock();
            state.scan = None;
            state.links.clear();
            state.pending_connects.clear();
        }
        self.adapter_tx.send_replace(adapter);
    }

    /// Publish an adapter state without touching scans or links, as a
    /// platform that reports power loss before its link callbacks
    pub fn report_adapter_state(&self, adapter: AdapterState) {
        self.adapter_tx.send_replace(adapter);
    }

    /// Bring a peripheral into range; advertised at once if a scan matches
    pub fn add_peripheral(&self, peripheral: SimPeripheral) {
        let mut state = self.state.lock();
        if let Some((filter, tx)) = &state.scan {
            if peripheral.matches(filter) {
                let _ = tx.try_send(peripheral.advertisement());
            }
        }
        state.in_range.retain(|p| p.id != peripheral.id);
        state.in_range.push(peripheral);
    }

    /// Re-send an advertisement for a peripheral already in range
    pub fn advertise(&self, id: &PeripheralId) -> bool {
        let state = self.state.lock();
        let Some((filter, tx)) = &state.scan else {
            return false;
        };
        match state.in_range.iter().find(|p| &p.id == id) {
            Some(p) if p.matches(filter) => tx.try_send(p.advertisement()).is_ok(),
            _ => false,
        }
    }

    /// Push a characteristic notification from a connected peripheral
    pub fn notify(&self, id: &PeripheralId, data: impl Into<Bytes>) -> bool {
        let data = data.into();
        let state = self.state.lock();
        let mut delivered = false;
        for link in state.links.values().filter(|l| &l.peripheral == id) {
            for (_, tx) in &link.subscriptions {
                delivered |= tx.try_send(data.clone()).is_ok();
            }
        }
        delivered
    }

    /// Simulate the peripheral walking out of range
    pub fn drop_link(&self, id: &PeripheralId) {
        let mut state = self.state.lock();
        state.links.retain(|_, link| &link.peripheral != id);
    }

    pub fn fail_next_connect(&self, error: Option<BleError>) {
        self.state.lock().fail_connect = error;
    }

    pub fn fail_discovery(&self, error: Option<BleError>) {
        self.state.lock().fail_discovery = error;
    }

    pub fn fail_subscribe(&self, error: Option<BleError>) {
        self.state.lock().fail_subscribe = error;
    }

    /// While held, `connect` suspends until released or cancelled
    pub fn hold_connects(&self, hold: bool) {
        self.hold_connects.send_replace(hold);
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scan.is_some()
    }

    pub fn connected_links(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().links.values().map(|l| l.subscriptions.len()).sum()
    }

    pub fn pending_connects(&self) -> usize {
        self.state.lock().pending_connects.len()
    }

    fn ensure_powered(&self) -> Result<(), BleError> {
        let adapter = *self.adapter_tx.borrow();
        if adapter.is_powered_on() {
            Ok(())
        } else {
            Err(BleError::AdapterNotReady(adapter))
        }
    }
}

#[async_trait]
impl BleCentral for SimBleCentral {
    fn adapter_state(&self) -> watch::Receiver<AdapterState> {
        self.adapter_tx.subscribe()
    }

    async fn start_scan(&self, filter: ScanFilter) -> Result<mpsc::Receiver<Advertisement>, BleError> {
        self.ensure_powered()?;
        let (tx, rx) = mpsc::channel(SIM_CHANNEL_CAPACITY);
        let mut state = self.state.lock();
        for peripheral in state.in_range.iter().filter(|p| p.matches(&filter)) {
            let _ = tx.try_send(peripheral.advertisement());
        }
        state.scan = Some((filter, tx));
        self.calls.scans_started.fetch_add(1, Ordering::Relaxed);
        debug!("sim_scan_started");
        Ok(rx)
    }

    fn stop_scan(&self) {
        if self.state.lock().scan.take().is_some() {
            self.calls.scans_stopped.fetch_add(1, Ordering::Relaxed);
            debug!("sim_scan_stopped");
        }
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<LinkHandle, BleError> {
        self.ensure_powered()?;
        self.calls.connects.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            if let Some(err) = state.fail_connect.take() {
                return Err(err);
            }
            if !state.in_range.iter().any(|p| &p.id == peripheral) {
                return Err(BleError::NotReachable);
            }
            state.pending_connects.push(peripheral.clone());
        }

        let mut hold = self.hold_connects.subscribe();
        if hold.wait_for(|held| !*held).await.is_err() {
            return Err(BleError::LinkClosed);
        }

        let mut state = self.state.lock();
        let Some(idx) = state.pending_connects.iter().position(|p| p == peripheral) else {
            // cancel_connect ran while we were waiting
            return Err(BleError::LinkClosed);
        };
        state.pending_connects.swap_remove(idx);
        self.ensure_powered()?;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        state
            .links
            .insert(token, SimLink { peripheral: peripheral.clone(), subscriptions: Vec::new() });
        Ok(LinkHandle { peripheral: peripheral.clone(), token })
    }

    fn cancel_connect(&self, peripheral: &PeripheralId) {
        let mut state = self.state.lock();
        let before = state.pending_connects.len();
        state.pending_connects.retain(|p| p != peripheral);
        if state.pending_connects.len() != before {
            self.calls.connects_cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn discover_services(&self, link: &LinkHandle) -> Result<Vec<GattService>, BleError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_discovery.take() {
            return Err(err);
        }
        if !state.links.contains_key(&link.token) {
            return Err(BleError::LinkClosed);
        }
        state
            .in_range
            .iter()
            .find(|p| p.id == link.peripheral)
            .map(|p| p.services.clone())
            .ok_or(BleError::LinkClosed)
    }

    async fn subscribe(
        &self,
        link: &LinkHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Notifications, BleError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_subscribe.take() {
            return Err(err);
        }
        let services = state
            .in_range
            .iter()
            .find(|p| p.id == link.peripheral)
            .map(|p| p.services.clone())
            .ok_or(BleError::LinkClosed)?;
        let gatt = services
            .iter()
            .find(|s| s.uuid == service)
            .ok_or(BleError::ServiceNotFound(service))?;
        if !gatt.has_characteristic(characteristic) {
            return Err(BleError::CharacteristicNotFound(characteristic));
        }

        let id = SubscriptionId(self.next_token.fetch_add(1, Ordering::Relaxed));
        let sim_link = state.links.get_mut(&link.token).ok_or(BleError::LinkClosed)?;
        let (tx, rx) = mpsc::channel(SIM_CHANNEL_CAPACITY);
        sim_link.subscriptions.push((id, tx));
        self.calls.subscriptions.fetch_add(1, Ordering::Relaxed);
        Ok(Notifications { id, rx })
    }

    fn unsubscribe(&self, link: &LinkHandle, subscription: SubscriptionId) {
        let mut state = self.state.lock();
        if let Some(sim_link) = state.links.get_mut(&link.token) {
            sim_link.subscriptions.retain(|(id, _)| *id != subscription);
        }
        self.calls.unsubscribes.fetch_add(1, Ordering::Relaxed);
    }

    fn disconnect(&self, link: &LinkHandle) {
        self.state.lock().links.remove(&link.token);
        self.calls.disconnects.fetch_add(1, Ordering::Relaxed);
    }
}

/// Scripted OS permission prompts
#[derive(Debug, Default)]
pub struct SimPermissions {
    states: Mutex<FxHashMap<PermissionId, PermissionState>>,
    responses: Mutex<FxHashMap<PermissionId, PermissionState>>,
    prompts: AtomicU64,
}

impl SimPermissions {
    /// Every permission already granted
    pub fn granted() -> Self {
        let sim = Self::default();
        for id in [
            PermissionId::Camera,
            PermissionId::BluetoothScan,
            PermissionId::BluetoothConnect,
            PermissionId::FineLocation,
            PermissionId::Bluetooth,
        ] {
            sim.set_state(id, PermissionState::Granted);
        }
        sim
    }

    pub fn set_state(&self, id: PermissionId, state: PermissionState) {
        self.states.lock().insert(id, state);
    }

    /// What the user will answer at the next prompt (default: grant)
    pub fn respond_with(&self, id: PermissionId, answer: PermissionState) {
        self.responses.lock().insert(id, answer);
    }

    pub fn prompts_shown(&self) -> u64 {
        self.prompts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PermissionProvider for SimPermissions {
    fn check(&self, id: PermissionId) -> PermissionState {
        self.states.lock().get(&id).copied().unwrap_or_default()
    }

    async fn request(&self, id: PermissionId) -> PermissionState {
        let current = self.check(id);
        if current.is_resolved() {
            return current;
        }
        self.prompts.fetch_add(1, Ordering::Relaxed);
        let answer =
            self.responses.lock().get(&id).copied().unwrap_or(PermissionState::Granted);
        self.set_state(id, answer);
        answer
    }
}

#[derive(Debug, Default)]
pub struct SimCamera {
    streaming: AtomicBool,
    symbologies: Mutex<Vec<Symbology>>,
}

impl SimCamera {
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    pub fn symbologies(&self) -> Vec<Symbology> {
        self.symbologies.lock().clone()
    }
}

impl CameraDevice for SimCamera {
    fn set_streaming(&self, active: bool) {
        self.streaming.store(active, Ordering::Relaxed);
    }

    fn configure_symbologies(&self, symbologies: &[Symbology]) {
        *self.symbologies.lock() = symbologies.to_vec();
    }
}
