//! Connection manager - the single BLE peripheral link
//!
//! Drives `Idle -> Connecting -> ServiceDiscovery -> Subscribing -> Active`
//! one step at a time. A failure at any step goes through `Faulted`,
//! releases whatever was acquired so far and lands back in `Idle`.
//!
//! While `Active`, a pump task decodes characteristic notifications and
//! forwards them to the arbiter. Link loss (notification stream closed or
//! adapter powered off) resets to `Idle` and raises one `LinkLost` notice.
//! There is no automatic reconnect.
//!
//! Every slot mutation after a suspension point checks the slot epoch, so
//! a stale handshake or pump can never clobber a newer connection.

use crate::domain::error::ScanError;
use crate::domain::types::{AdapterState, ConnectionState, Notice, PeripheralId};
use crate::infra::config::{Config, PayloadEncoding};
use crate::infra::metrics::Metrics;
use crate::io::ble::{decode_notification, BleCentral, BleError, LinkHandle, SubscriptionId};
use crate::services::arbiter::BleInput;
use crate::services::radio::{Radio, RadioUse};
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Default)]
struct Slot {
    epoch: u64,
    peripheral: Option<PeripheralId>,
    link: Option<LinkHandle>,
    subscription: Option<SubscriptionId>,
    pump: Option<JoinHandle<()>>,
    cancel_tx: Option<watch::Sender<bool>>,
}

impl Slot {
    /// Release platform resources in teardown order: subscription, then link.
    /// Without a link the connect itself is still pending and gets cancelled.
    fn release(&mut self, ble: &dyn BleCentral) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        match self.link.take() {
            Some(link) => {
                if let Some(subscription) = self.subscription.take() {
                    ble.unsubscribe(&link, subscription);
                }
                ble.disconnect(&link);
            }
            None => {
                if let Some(peripheral) = &self.peripheral {
                    ble.cancel_connect(peripheral);
                }
            }
        }
        self.subscription = None;
        self.cancel_tx = None;
        self.peripheral = None;
        self.epoch += 1;
    }
}

struct Inner {
    ble: Arc<dyn BleCentral>,
    radio: Radio,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    encoding: PayloadEncoding,
    arbiter_tx: mpsc::Sender<BleInput>,
    notice_tx: broadcast::Sender<Notice>,
    metrics: Arc<Metrics>,
    state_tx: watch::Sender<ConnectionState>,
    slot: Mutex<Slot>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous.as_str(), to = %state.as_str(), "connection_state");
        }
    }

    /// Advance the handshake if the slot still belongs to `epoch`
    fn advance(&self, epoch: u64, state: ConnectionState) -> Result<(), ScanError> {
        let slot = self.slot.lock();
        if slot.epoch != epoch {
            return Err(ScanError::Cancelled);
        }
        self.set_state(state);
        Ok(())
    }

    /// Tear down a handshake that did not reach a running pump
    fn abort_handshake(&self, epoch: u64, peripheral: &PeripheralId, err: &ScanError) {
        {
            let mut slot = self.slot.lock();
            if slot.epoch != epoch {
                return;
            }
            let via = match err {
                ScanError::Cancelled | ScanError::SourceBusy(_) => ConnectionState::Disconnecting,
                _ => ConnectionState::Faulted,
            };
            self.set_state(via);
            slot.release(self.ble.as_ref());
            self.set_state(ConnectionState::Idle);
        }

        match err {
            ScanError::ConnectionFailed { reason, .. }
            | ScanError::SubscriptionFailed { reason, .. } => {
                self.metrics.record_connection_failed();
                warn!(peripheral = %peripheral, error = %err, "ble_connection_failed");
                let _ = self.notice_tx.send(Notice::ConnectionFailed {
                    peripheral: peripheral.clone(),
                    reason: reason.clone(),
                });
            }
            ScanError::AdapterUnavailable(state) => {
                self.metrics.record_connection_failed();
                warn!(peripheral = %peripheral, adapter = %state.as_str(), "ble_connection_failed");
                let _ = self.notice_tx.send(Notice::AdapterUnavailable { state: *state });
            }
            _ => info!(peripheral = %peripheral, reason = %err.kind(), "ble_connection_aborted"),
        }
    }

    /// Fault path for an established link. Raises the notice exactly once
    /// per connection; later callers with the same epoch are no-ops.
    async fn link_lost(&self, epoch: u64, peripheral: &PeripheralId, reason: String) {
        {
            let mut slot = self.slot.lock();
            if slot.epoch != epoch || self.state() != ConnectionState::Active {
                return;
            }
            self.set_state(ConnectionState::Faulted);
            // this runs on the pump itself; dropping the handle detaches it
            slot.pump = None;
            slot.release(self.ble.as_ref());
            self.set_state(ConnectionState::Idle);
        }

        self.metrics.record_link_lost();
        warn!(peripheral = %peripheral, reason = %reason, "ble_link_lost");
        let _ = self
            .notice_tx
            .send(Notice::LinkLost { peripheral: peripheral.clone(), reason });
        let _ = self.arbiter_tx.send(BleInput::Unlinked { peripheral: peripheral.clone() }).await;
    }
}

/// Await `fut` unless the cancel flag is raised first
async fn cancellable<T>(
    cancel_rx: &mut watch::Receiver<bool>,
    fut: impl Future<Output = T>,
) -> Result<T, ScanError> {
    tokio::select! {
        biased;
        _ = cancelled(cancel_rx) => Err(ScanError::Cancelled),
        out = fut => Ok(out),
    }
}

async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn connect_error(peripheral: &PeripheralId, err: BleError) -> ScanError {
    match err {
        BleError::AdapterNotReady(state) => ScanError::AdapterUnavailable(state),
        other => ScanError::ConnectionFailed {
            peripheral: peripheral.clone(),
            reason: other.to_string(),
        },
    }
}

pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: &Config,
        ble: Arc<dyn BleCentral>,
        radio: Radio,
        arbiter_tx: mpsc::Sender<BleInput>,
        notice_tx: broadcast::Sender<Notice>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                ble,
                radio,
                service_uuid: config.service_uuid(),
                characteristic_uuid: config.characteristic_uuid(),
                encoding: config.payload_encoding(),
                arbiter_tx,
                notice_tx,
                metrics,
                state_tx,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Peripheral of the current (or in-progress) connection
    pub fn peripheral(&self) -> Option<PeripheralId> {
        self.inner.slot.lock().peripheral.clone()
    }

    /// Connect, discover the configured service, subscribe to the scanner
    /// characteristic and hand the link to the arbiter.
    pub async fn connect(&self, peripheral: PeripheralId) -> Result<(), ScanError> {
        let inner = &self.inner;
        let (epoch, mut cancel_rx, claim) = {
            let mut slot = inner.slot.lock();
            let state = inner.state();
            if state == ConnectionState::Active || state.is_transitioning() {
                let current = slot.peripheral.clone().unwrap_or_else(|| peripheral.clone());
                debug!(requested = %peripheral, current = %current, "ble_connect_rejected");
                return Err(ScanError::ConnectionBusy(current));
            }
            let adapter = *inner.ble.adapter_state().borrow();
            if !adapter.is_powered_on() {
                return Err(ScanError::AdapterUnavailable(adapter));
            }
            let claim = inner.radio.try_claim(RadioUse::Connecting)?;

            let (cancel_tx, cancel_rx) = watch::channel(false);
            slot.epoch += 1;
            slot.peripheral = Some(peripheral.clone());
            slot.cancel_tx = Some(cancel_tx);
            inner.set_state(ConnectionState::Connecting);
            (slot.epoch, cancel_rx, claim)
        };
        info!(peripheral = %peripheral, "ble_connecting");

        let result = self.handshake(epoch, &peripheral, &mut cancel_rx).await;
        drop(claim);

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                inner.abort_handshake(epoch, &peripheral, &err);
                Err(err)
            }
        }
    }

    async fn handshake(
        &self,
        epoch: u64,
        peripheral: &PeripheralId,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), ScanError> {
        let inner = &self.inner;
        let ble = inner.ble.as_ref();

        let link = cancellable(cancel_rx, ble.connect(peripheral))
            .await?
            .map_err(|e| connect_error(peripheral, e))?;
        {
            let mut slot = inner.slot.lock();
            if slot.epoch != epoch {
                ble.disconnect(&link);
                return Err(ScanError::Cancelled);
            }
            slot.link = Some(link.clone());
        }

        inner.advance(epoch, ConnectionState::ServiceDiscovery)?;
        let services = cancellable(cancel_rx, ble.discover_services(&link))
            .await?
            .map_err(|e| connect_error(peripheral, e))?;
        let service = services
            .iter()
            .find(|s| s.uuid == inner.service_uuid)
            .ok_or_else(|| connect_error(peripheral, BleError::ServiceNotFound(inner.service_uuid)))?;
        if !service.has_characteristic(inner.characteristic_uuid) {
            return Err(connect_error(
                peripheral,
                BleError::CharacteristicNotFound(inner.characteristic_uuid),
            ));
        }

        inner.advance(epoch, ConnectionState::Subscribing)?;
        let notifications = cancellable(
            cancel_rx,
            ble.subscribe(&link, inner.service_uuid, inner.characteristic_uuid),
        )
        .await?
        .map_err(|e| ScanError::SubscriptionFailed {
            peripheral: peripheral.clone(),
            reason: e.to_string(),
        })?;
        // observe power from before Active so no change is missed
        let adapter_rx = ble.adapter_state();
        {
            let mut slot = inner.slot.lock();
            if slot.epoch != epoch {
                ble.unsubscribe(&link, notifications.id);
                return Err(ScanError::Cancelled);
            }
            slot.subscription = Some(notifications.id);
            inner.set_state(ConnectionState::Active);
        }

        // The arbiter decides whether Bluetooth may become the active source
        let (reply_tx, reply_rx) = oneshot::channel();
        let linked = BleInput::Linked { peripheral: peripheral.clone(), reply: reply_tx };
        if inner.arbiter_tx.send(linked).await.is_err() {
            return Err(ScanError::ShutDown);
        }
        match cancellable(cancel_rx, reply_rx).await? {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(ScanError::ShutDown),
        }

        {
            let mut slot = inner.slot.lock();
            if slot.epoch != epoch || inner.state() != ConnectionState::Active {
                // disconnect() already tore the link down and unlinked it
                return Err(ScanError::Cancelled);
            }
            let pump = tokio::spawn(pump_notifications(
                inner.clone(),
                epoch,
                peripheral.clone(),
                notifications.rx,
                adapter_rx,
            ));
            slot.pump = Some(pump);
            slot.cancel_tx = None;
        }

        inner.metrics.record_connection_established();
        info!(peripheral = %peripheral, "ble_connected");
        Ok(())
    }

    /// Idempotent. While `Active`, tears the link down; mid-handshake,
    /// cancels it and waits for the slot to settle back to `Idle`.
    pub async fn disconnect(&self) -> Result<(), ScanError> {
        let inner = &self.inner;
        let torn_down = {
            let mut slot = inner.slot.lock();
            match inner.state() {
                ConnectionState::Idle | ConnectionState::Faulted => return Ok(()),
                ConnectionState::Active => {
                    let peripheral = slot.peripheral.clone();
                    inner.set_state(ConnectionState::Disconnecting);
                    slot.release(inner.ble.as_ref());
                    inner.set_state(ConnectionState::Idle);
                    peripheral
                }
                ConnectionState::Connecting
                | ConnectionState::ServiceDiscovery
                | ConnectionState::Subscribing
                | ConnectionState::Disconnecting => {
                    if let Some(cancel_tx) = &slot.cancel_tx {
                        cancel_tx.send_replace(true);
                    }
                    None
                }
            }
        };

        match torn_down {
            Some(peripheral) => {
                info!(peripheral = %peripheral, "ble_disconnected");
                let _ = inner
                    .notice_tx
                    .send(Notice::Disconnected { peripheral: peripheral.clone() });
                let _ = inner.arbiter_tx.send(BleInput::Unlinked { peripheral }).await;
            }
            None => {
                let mut state_rx = inner.state_tx.subscribe();
                let _ = state_rx.wait_for(|s| *s == ConnectionState::Idle).await;
            }
        }
        Ok(())
    }
}

async fn pump_notifications(
    inner: Arc<Inner>,
    epoch: u64,
    peripheral: PeripheralId,
    mut rx: mpsc::Receiver<Bytes>,
    mut adapter_rx: watch::Receiver<AdapterState>,
) {
    debug!(peripheral = %peripheral, "ble_pump_started");
    let reason = loop {
        let adapter = *adapter_rx.borrow_and_update();
        if !adapter.is_powered_on() {
            break format!("adapter {}", adapter.as_str());
        }
        tokio::select! {
            raw = rx.recv() => match raw {
                Some(raw) => {
                    trace!(peripheral = %peripheral, raw = %hex::encode(&raw), "ble_notification");
                    match decode_notification(&raw, inner.encoding) {
                        Some(payload) => {
                            let data = BleInput::Data { peripheral: peripheral.clone(), payload };
                            if inner.arbiter_tx.send(data).await.is_err() {
                                return;
                            }
                        }
                        None => {
                            inner.metrics.record_empty_payload();
                            debug!(peripheral = %peripheral, "ble_empty_notification_dropped");
                        }
                    }
                }
                None => break "link closed".to_string(),
            },
            changed = adapter_rx.changed() => {
                if changed.is_err() {
                    break format!("adapter {}", AdapterState::Unknown.as_str());
                }
            }
        }
    };
    inner.link_lost(epoch, &peripheral, reason).await;
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let mut slot = self.inner.slot.lock();
        if slot.peripheral.is_some() {
            slot.release(self.inner.ble.as_ref());
            self.inner.set_state(ConnectionState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::SourceKind;
    use crate::io::sim::{SimBleCentral, SimPeripheral};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        sim: Arc<SimBleCentral>,
        radio: Radio,
        manager: Arc<ConnectionManager>,
        arbiter_rx: mpsc::Receiver<BleInput>,
        notices: broadcast::Receiver<Notice>,
        metrics: Arc<Metrics>,
    }

    fn harness() -> Harness {
        let config = Config::default();
        let sim = Arc::new(SimBleCentral::default());
        sim.add_peripheral(SimPeripheral::scanner(
            "AA",
            Some("Scanner"),
            config.service_uuid(),
            config.characteristic_uuid(),
        ));
        let radio = Radio::new();
        let (arbiter_tx, arbiter_rx) = mpsc::channel(16);
        let (notice_tx, notices) = broadcast::channel(16);
        let metrics = Arc::new(Metrics::new());
        let manager = Arc::new(ConnectionManager::new(
            &config,
            sim.clone(),
            radio.clone(),
            arbiter_tx,
            notice_tx,
            metrics.clone(),
        ));
        Harness { sim, radio, manager, arbiter_rx, notices, metrics }
    }

    /// What the stand-in arbiter observed
    #[derive(Debug)]
    enum Seen {
        Linked(PeripheralId),
        Data(String),
        Unlinked(PeripheralId),
    }

    fn source_busy() -> ScanError {
        ScanError::SourceBusy(SourceKind::BluetoothPeripheral)
    }

    /// Stand-in arbiter that accepts or rejects every link
    fn spawn_arbiter(mut rx: mpsc::Receiver<BleInput>, accept: bool) -> mpsc::Receiver<Seen> {
        let (seen_tx, seen_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(input) = rx.recv().await {
                let seen = match input {
                    BleInput::Linked { peripheral, reply } => {
                        let _ = reply.send(if accept { Ok(()) } else { Err(source_busy()) });
                        Seen::Linked(peripheral)
                    }
                    BleInput::Data { payload, .. } => Seen::Data(payload),
                    BleInput::Unlinked { peripheral } => Seen::Unlinked(peripheral),
                };
                if seen_tx.send(seen).await.is_err() {
                    break;
                }
            }
        });
        seen_rx
    }

    fn aa() -> PeripheralId {
        PeripheralId::new("AA")
    }

    #[tokio::test]
    async fn test_connect_reaches_active() {
        let h = harness();
        let mut events = spawn_arbiter(h.arbiter_rx, true);

        h.manager.connect(aa()).await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Active);
        assert_eq!(h.manager.peripheral(), Some(aa()));
        assert_eq!(h.sim.active_subscriptions(), 1);
        assert_eq!(h.radio.current(), RadioUse::Idle);
        assert!(matches!(events.recv().await, Some(Seen::Linked(p)) if p == aa()));
        assert_eq!(h.metrics.report().connections_established_total, 1);
    }

    #[tokio::test]
    async fn test_notifications_forwarded_and_empty_dropped() {
        let h = harness();
        let mut events = spawn_arbiter(h.arbiter_rx, true);
        h.manager.connect(aa()).await.unwrap();
        let _linked = events.recv().await;

        assert!(h.sim.notify(&aa(), &b" ABC-1 \r\n"[..]));
        assert!(h.sim.notify(&aa(), &b"  "[..]));
        assert!(h.sim.notify(&aa(), &b"ABC-2"[..]));

        let mut payloads = Vec::new();
        for _ in 0..2 {
            match events.recv().await {
                Some(Seen::Data(payload)) => payloads.push(payload),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(payloads, vec!["ABC-1", "ABC-2"]);
        assert_eq!(h.manager.state(), ConnectionState::Active);
        assert_eq!(h.metrics.empty_payload_total(), 1);
    }

    #[tokio::test]
    async fn test_connect_while_active_rejected_without_teardown() {
        let h = harness();
        let _events = spawn_arbiter(h.arbiter_rx, true);
        h.manager.connect(aa()).await.unwrap();

        let err = h.manager.connect(PeripheralId::new("BB")).await.unwrap_err();
        assert_eq!(err, ScanError::ConnectionBusy(aa()));
        assert_eq!(h.manager.state(), ConnectionState::Active);
        assert_eq!(h.sim.connected_links(), 1);
        assert_eq!(h.sim.active_subscriptions(), 1);
        assert_eq!(h.sim.calls().disconnects.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_missing_service_faults_and_releases() {
        let h = harness();
        let _events = spawn_arbiter(h.arbiter_rx, true);
        let mut notices = h.notices;
        h.sim.add_peripheral(SimPeripheral::scanner("CC", None, Uuid::from_u128(1), Uuid::from_u128(2)));
        let mut states = h.manager.watch();

        let err = h.manager.connect(PeripheralId::new("CC")).await.unwrap_err();
        assert!(matches!(err, ScanError::ConnectionFailed { ref peripheral, .. } if peripheral.as_str() == "CC"));
        assert!(err.to_string().contains("CC"));
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Idle);
        assert_eq!(h.sim.connected_links(), 0);
        assert!(matches!(notices.recv().await, Ok(Notice::ConnectionFailed { .. })));
        assert_eq!(h.radio.current(), RadioUse::Idle);
    }

    #[tokio::test]
    async fn test_subscribe_failure_releases_link() {
        let h = harness();
        let _events = spawn_arbiter(h.arbiter_rx, true);
        h.sim.fail_subscribe(Some(BleError::Gatt("insufficient authentication".into())));

        let err = h.manager.connect(aa()).await.unwrap_err();
        assert!(matches!(err, ScanError::SubscriptionFailed { .. }));
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        assert_eq!(h.sim.connected_links(), 0);
        assert_eq!(h.sim.active_subscriptions(), 0);
        assert_eq!(h.sim.calls().disconnects.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unreachable_peripheral() {
        let h = harness();
        let _events = spawn_arbiter(h.arbiter_rx, true);
        let err = h.manager.connect(PeripheralId::new("ZZ")).await.unwrap_err();
        assert_eq!(
            err,
            ScanError::ConnectionFailed {
                peripheral: PeripheralId::new("ZZ"),
                reason: "peripheral not reachable".into()
            }
        );
        assert_eq!(h.metrics.report().connections_failed_total, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let h = harness();
        let mut events = spawn_arbiter(h.arbiter_rx, true);
        let mut notices = h.notices;
        assert_eq!(h.manager.disconnect().await, Ok(()));

        h.manager.connect(aa()).await.unwrap();
        let _linked = events.recv().await;
        assert_eq!(h.manager.disconnect().await, Ok(()));
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        assert_eq!(h.sim.connected_links(), 0);
        assert_eq!(h.sim.calls().unsubscribes.load(Ordering::Relaxed), 1);
        assert!(matches!(events.recv().await, Some(Seen::Unlinked(p)) if p == aa()));
        assert_eq!(notices.recv().await.unwrap(), Notice::Disconnected { peripheral: aa() });

        assert_eq!(h.manager.disconnect().await, Ok(()));
        assert_eq!(h.sim.calls().disconnects.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_connect() {
        let h = harness();
        let _events = spawn_arbiter(h.arbiter_rx, true);
        h.sim.hold_connects(true);

        let manager = h.manager.clone();
        let pending = tokio::spawn(async move { manager.connect(aa()).await });
        let mut states = h.manager.watch();
        states.wait_for(|s| *s == ConnectionState::Connecting).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(h.manager.disconnect().await, Ok(()));
        assert_eq!(pending.await.unwrap(), Err(ScanError::Cancelled));
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        assert_eq!(h.sim.pending_connects(), 0);
        assert_eq!(h.sim.connected_links(), 0);
        assert_eq!(h.radio.current(), RadioUse::Idle);
    }

    #[tokio::test]
    async fn test_link_drop_raises_link_lost_once() {
        let h = harness();
        let mut events = spawn_arbiter(h.arbiter_rx, true);
        let mut notices = h.notices;
        h.manager.connect(aa()).await.unwrap();
        let _linked = events.recv().await;

        h.sim.drop_link(&aa());
        assert!(matches!(events.recv().await, Some(Seen::Unlinked(p)) if p == aa()));
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        assert!(matches!(notices.recv().await, Ok(Notice::LinkLost { .. })));
        assert!(notices.try_recv().is_err());
        assert_eq!(h.metrics.link_lost_total(), 1);
    }

    #[tokio::test]
    async fn test_adapter_power_off_while_active() {
        let h = harness();
        let mut events = spawn_arbiter(h.arbiter_rx, true);
        let mut notices = h.notices;
        h.manager.connect(aa()).await.unwrap();
        let _linked = events.recv().await;

        h.sim.set_adapter_state(AdapterState::PoweredOff);
        assert!(matches!(events.recv().await, Some(Seen::Unlinked(_))));
        assert_eq!(h.manager.state(), ConnectionState::Idle);

        // give a second trigger a chance to run
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(notices.recv().await, Ok(Notice::LinkLost { .. })));
        assert!(notices.try_recv().is_err());
        assert_eq!(h.metrics.link_lost_total(), 1);
    }

    #[tokio::test]
    async fn test_adapter_power_off_while_link_accepted() {
        let h = harness();
        let mut notices = h.notices;
        let sim = h.sim.clone();
        let mut rx = h.arbiter_rx;
        let (unlinked_tx, mut unlinked) = mpsc::channel(4);
        // power drops after Active but before the notification pump runs;
        // links stay up so only the adapter state can report it
        tokio::spawn(async move {
            while let Some(input) = rx.recv().await {
                match input {
                    BleInput::Linked { reply, .. } => {
                        sim.report_adapter_state(AdapterState::PoweredOff);
                        let _ = reply.send(Ok(()));
                    }
                    BleInput::Unlinked { peripheral } => {
                        let _ = unlinked_tx.send(peripheral).await;
                    }
                    BleInput::Data { .. } => {}
                }
            }
        });

        h.manager.connect(aa()).await.unwrap();
        let lost = tokio::time::timeout(Duration::from_secs(1), unlinked.recv()).await;
        assert!(matches!(lost, Ok(Some(p)) if p == aa()));
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        match notices.recv().await {
            Ok(Notice::LinkLost { peripheral, reason }) => {
                assert_eq!(peripheral, aa());
                assert_eq!(reason, "adapter powered_off");
            }
            other => panic!("expected LinkLost, got {other:?}"),
        }
        assert!(notices.try_recv().is_err());
        assert_eq!(h.metrics.link_lost_total(), 1);
    }

    #[tokio::test]
    async fn test_arbiter_rejection_tears_down() {
        let h = harness();
        let _events = spawn_arbiter(h.arbiter_rx, false);
        let err = h.manager.connect(aa()).await.unwrap_err();
        assert_eq!(err, source_busy());
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        assert_eq!(h.sim.connected_links(), 0);
    }

    #[tokio::test]
    async fn test_connect_rejected_during_discovery() {
        let h = harness();
        let _claim = h.radio.try_claim(RadioUse::Discovering).unwrap();
        let err = h.manager.connect(aa()).await.unwrap_err();
        assert_eq!(err, ScanError::RadioBusy("discovery in progress"));
        assert_eq!(h.manager.state(), ConnectionState::Idle);
    }
}
