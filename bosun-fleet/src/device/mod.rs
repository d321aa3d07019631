pub mod button;
pub mod repeater;
pub mod watch;

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use bosun_core::{DeviceId, DeviceKind, EventKind, Percentage, device_topic, repeater_topic};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::config::FleetTiming;
use crate::recorder::EventRecorder;

use button::Button;
use repeater::Repeater;
use watch::Smartwatch;

/// Battery level below which a `low_battery` event fires.
const LOW_BATTERY_THRESHOLD: u8 = 20;
/// Signal level below which a `poor_signal` event fires.
const POOR_SIGNAL_THRESHOLD: u8 = 30;
/// Battery drained per heartbeat tick.
const HEARTBEAT_DRAIN: u8 = 1;
/// Bounded random signal fluctuation per heartbeat tick.
const SIGNAL_JITTER: i16 = 3;
/// Fraction of publishes silently dropped under a packet-loss fault.
const PACKET_LOSS_RATIO: f64 = 0.5;

/// Immutable identity and configuration of a device, fixed at creation.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub id: DeviceId,
    pub name: Box<str>,
    pub kind: DeviceKind,
    pub location: Box<str>,
    pub namespace: Box<str>,
    pub battery: Percentage,
    pub signal: Percentage,
}

/// Transport-level fault kinds a device can simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailure {
    PacketLoss,
    HighLatency,
    Disconnect,
}

#[derive(Debug, Clone)]
enum NetFaultMode {
    PacketLoss { drop_ratio: f64 },
    HighLatency { max_delay: Duration },
}

struct ActiveNetFault {
    mode: NetFaultMode,
    expires: tokio::time::Instant,
}

struct RuntimeState {
    battery: Percentage,
    signal: Percentage,
    connected: bool,
    active: bool,
    net_fault: Option<ActiveNetFault>,
    last_heartbeat: Option<jiff::Timestamp>,
    /// Pending auto-restore for a timed offline window. Replaced on every
    /// `simulate_offline` call so only the newest deadline can fire.
    restore: Option<CancellationToken>,
}

/// Point-in-time view of a device, published on the status channel.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatusSnapshot {
    pub id: DeviceId,
    pub name: Box<str>,
    pub kind: DeviceKind,
    pub location: Box<str>,
    pub battery: Percentage,
    pub signal: Percentage,
    pub connected: bool,
    pub active: bool,
    pub last_heartbeat: Option<jiff::Timestamp>,
    pub timestamp: jiff::Timestamp,
}

/// Base capability shared by every simulated device: broker connection,
/// heartbeat loop, battery/signal drift, and status publication.
///
/// All mutable state sits behind one lock, so a heartbeat tick and a failure
/// injector targeting the same device serialize instead of losing updates.
/// Every spawned task selects on a child of the root cancellation token; no
/// timer outlives the device.
pub struct DeviceCore {
    config: DeviceConfig,
    timing: FleetTiming,
    broker: Arc<dyn Broker>,
    recorder: EventRecorder,
    state: Mutex<RuntimeState>,
    cancel: CancellationToken,
    heartbeat: std::sync::Mutex<Option<CancellationToken>>,
}

impl DeviceCore {
    pub fn new(config: DeviceConfig, broker: Arc<dyn Broker>, timing: FleetTiming) -> Arc<Self> {
        let recorder = EventRecorder::new(config.id.clone());
        Arc::new(Self {
            state: Mutex::new(RuntimeState {
                battery: config.battery,
                signal: config.signal,
                connected: false,
                active: false,
                net_fault: None,
                last_heartbeat: None,
                restore: None,
            }),
            config,
            timing,
            broker,
            recorder,
            cancel: CancellationToken::new(),
            heartbeat: std::sync::Mutex::new(None),
        })
    }

    pub fn id(&self) -> &DeviceId {
        &self.config.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.config.kind
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn timing(&self) -> &FleetTiming {
        &self.timing
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    /// Token scoped to this device's lifetime. Tasks derived from it are
    /// cancelled when the device shuts down.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn client_id(&self) -> String {
        format!("sim-{}", self.config.id)
    }

    /// Connect to the broker and start the heartbeat loop. Connecting while
    /// already connected is a no-op.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BrokerError> {
        {
            let state = self.state.lock().await;
            if state.connected {
                return Ok(());
            }
        }
        self.broker.connect(&self.client_id()).await?;
        {
            let mut state = self.state.lock().await;
            state.connected = true;
            state.active = true;
        }
        self.recorder.record(EventKind::Connected, json!({}));
        info!(device_id = %self.config.id, kind = %self.config.kind, "Device connected");
        self.start_heartbeat();
        self.publish_status().await;
        Ok(())
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let token = self.cancel.child_token();
        {
            let mut slot = self
                .heartbeat
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(prev) = slot.replace(token.clone()) {
                prev.cancel();
            }
        }

        let core = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(core.timing.heartbeat());
            // The first tick completes immediately; consume it so the first
            // heartbeat lands one interval after connect.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => core.heartbeat_tick().await,
                }
            }
        });
    }

    fn stop_heartbeat(&self) {
        let taken = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = taken {
            token.cancel();
        }
    }

    async fn heartbeat_tick(self: &Arc<Self>) {
        let (battery, signal) = {
            let mut state = self.state.lock().await;
            if !state.connected {
                return;
            }
            let prev_battery = state.battery;
            let prev_signal = state.signal;
            state.battery = prev_battery.drain(HEARTBEAT_DRAIN);
            let jitter = rand::rng().random_range(-SIGNAL_JITTER..=SIGNAL_JITTER);
            state.signal = prev_signal.adjust(jitter);
            state.last_heartbeat = Some(jiff::Timestamp::now());
            self.threshold_events(prev_battery, state.battery, prev_signal, state.signal);
            (state.battery, state.signal)
        };

        self.recorder.record(
            EventKind::Heartbeat,
            json!({ "battery": battery.0, "signal": signal.0 }),
        );
        self.publish(
            "heartbeat",
            json!({ "battery": battery.0, "signal": signal.0 }),
        )
        .await;
        self.publish_status().await;
    }

    /// Emit domain events on downward threshold crossings. Edge-triggered so
    /// consumers can assert on thresholds without deduplicating.
    fn threshold_events(
        &self,
        prev_battery: Percentage,
        battery: Percentage,
        prev_signal: Percentage,
        signal: Percentage,
    ) {
        if prev_battery.0 >= LOW_BATTERY_THRESHOLD && battery.0 < LOW_BATTERY_THRESHOLD {
            self.recorder
                .record(EventKind::LowBattery, json!({ "battery": battery.0 }));
            warn!(device_id = %self.config.id, battery = battery.0, "Battery low");
        }
        if prev_signal.0 >= POOR_SIGNAL_THRESHOLD && signal.0 < POOR_SIGNAL_THRESHOLD {
            self.recorder
                .record(EventKind::PoorSignal, json!({ "signal": signal.0 }));
            warn!(device_id = %self.config.id, signal = signal.0, "Signal poor");
        }
    }

    /// Publish on the per-device topic. A silent no-op while offline: a
    /// device that cannot transmit is not an error.
    pub async fn publish(self: &Arc<Self>, channel: &str, payload: serde_json::Value) {
        let topic = device_topic(&self.config.namespace, &self.config.id, channel);
        self.publish_to(topic, payload).await;
    }

    /// Publish on the repeater-specific topic tree.
    pub async fn publish_repeater(self: &Arc<Self>, channel: &str, payload: serde_json::Value) {
        let topic = repeater_topic(&self.config.namespace, &self.config.id, channel);
        self.publish_to(topic, payload).await;
    }

    async fn publish_to(self: &Arc<Self>, topic: String, mut payload: serde_json::Value) {
        let fault = {
            let mut state = self.state.lock().await;
            if !state.connected {
                return;
            }
            if let Some(f) = &state.net_fault {
                if tokio::time::Instant::now() >= f.expires {
                    state.net_fault = None;
                }
            }
            state.net_fault.as_ref().map(|f| f.mode.clone())
        };

        if let Some(obj) = payload.as_object_mut() {
            obj.insert("device_id".into(), json!(self.config.id.as_str()));
            obj.insert("timestamp".into(), json!(jiff::Timestamp::now().to_string()));
            obj.insert("simulated".into(), json!(true));
        }

        match fault {
            Some(NetFaultMode::PacketLoss { drop_ratio }) => {
                if rand::rng().random_bool(drop_ratio) {
                    debug!(device_id = %self.config.id, topic, "Publish dropped (packet loss)");
                    return;
                }
                self.send(&topic, payload).await;
            }
            Some(NetFaultMode::HighLatency { max_delay }) => {
                let delay_ms = rand::rng().random_range(0..=max_delay.as_millis() as u64);
                let core = Arc::clone(self);
                let cancel = self.cancel.child_token();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                            core.send(&topic, payload).await;
                        }
                    }
                });
            }
            None => self.send(&topic, payload).await,
        }
    }

    async fn send(&self, topic: &str, payload: serde_json::Value) {
        if let Err(e) = self.broker.publish(topic, payload).await {
            warn!(device_id = %self.config.id, topic, error = %e, "Publish failed");
        }
    }

    pub async fn status(&self) -> DeviceStatusSnapshot {
        let state = self.state.lock().await;
        DeviceStatusSnapshot {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            kind: self.config.kind,
            location: self.config.location.clone(),
            battery: state.battery,
            signal: state.signal,
            connected: state.connected,
            active: state.active,
            last_heartbeat: state.last_heartbeat,
            timestamp: jiff::Timestamp::now(),
        }
    }

    pub async fn publish_status(self: &Arc<Self>) {
        let snapshot = self.status().await;
        match serde_json::to_value(&snapshot) {
            Ok(value) => self.publish("status", value).await,
            Err(e) => warn!(device_id = %self.config.id, error = %e, "Status serialization failed"),
        }
    }

    /// Take the device offline: the heartbeat stops and publishes become
    /// no-ops. With a duration, connectivity restores automatically.
    ///
    /// Calling this while already offline re-arms the restore timer: any
    /// pending auto-restore is cancelled and the new duration (or lack of
    /// one) takes over.
    pub async fn simulate_offline(self: &Arc<Self>, duration: Option<Duration>) {
        let restore = duration.map(|_| self.cancel.child_token());
        let was_connected = {
            let mut state = self.state.lock().await;
            let was_connected = state.connected;
            state.connected = false;
            if let Some(prev) = state.restore.take() {
                prev.cancel();
            }
            state.restore = restore.clone();
            was_connected
        };

        if was_connected {
            self.stop_heartbeat();
            self.recorder.record(
                EventKind::Disconnected,
                json!({
                    "reason": "simulated_offline",
                    "duration_ms": duration.map(|d| d.as_millis() as u64),
                }),
            );
            info!(device_id = %self.config.id, ?duration, "Device offline");
        }

        if let (Some(d), Some(token)) = (duration, restore) {
            let core = Arc::clone(self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(d) => core.simulate_online().await,
                }
            });
        }
    }

    /// Restore connectivity and restart the heartbeat. No-op while online.
    pub async fn simulate_online(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.connected {
                return;
            }
            state.connected = true;
            if let Some(pending) = state.restore.take() {
                pending.cancel();
            }
        }
        self.recorder
            .record(EventKind::Connected, json!({ "reason": "restored" }));
        info!(device_id = %self.config.id, "Device back online");
        self.start_heartbeat();
        self.publish_status().await;
    }

    /// Degrade the transport for a fixed window.
    pub async fn simulate_network_failure(self: &Arc<Self>, kind: NetworkFailure) {
        let window = self.timing.network_fault_window();
        match kind {
            NetworkFailure::PacketLoss => {
                self.install_net_fault(
                    NetFaultMode::PacketLoss {
                        drop_ratio: PACKET_LOSS_RATIO,
                    },
                    window,
                )
                .await;
                self.recorder.record(
                    EventKind::NetworkFailure,
                    json!({ "kind": "packet_loss", "window_ms": window.as_millis() as u64 }),
                );
            }
            NetworkFailure::HighLatency => {
                self.install_net_fault(
                    NetFaultMode::HighLatency {
                        max_delay: window / 5,
                    },
                    window,
                )
                .await;
                self.recorder.record(
                    EventKind::NetworkFailure,
                    json!({ "kind": "high_latency", "window_ms": window.as_millis() as u64 }),
                );
            }
            NetworkFailure::Disconnect => {
                self.recorder
                    .record(EventKind::NetworkFailure, json!({ "kind": "disconnect" }));
                self.simulate_offline(Some(window)).await;
            }
        }
    }

    async fn install_net_fault(&self, mode: NetFaultMode, window: Duration) {
        let mut state = self.state.lock().await;
        state.net_fault = Some(ActiveNetFault {
            mode,
            expires: tokio::time::Instant::now() + window,
        });
    }

    pub async fn battery(&self) -> Percentage {
        self.state.lock().await.battery
    }

    pub async fn signal(&self) -> Percentage {
        self.state.lock().await.signal
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    /// Logical enable/disable, independent of transport connectivity.
    pub async fn set_active(&self, active: bool) {
        self.state.lock().await.active = active;
    }

    /// Drain battery by a fixed amount, firing threshold events on crossing.
    pub async fn drain_battery(&self, amount: u8) {
        let mut state = self.state.lock().await;
        let prev = state.battery;
        state.battery = prev.drain(amount);
        let signal = state.signal;
        self.threshold_events(prev, state.battery, signal, signal);
    }

    /// Set battery to an explicit level (simulated recharge or a failure
    /// injector jump).
    pub async fn set_battery(&self, level: Percentage) {
        let mut state = self.state.lock().await;
        let prev = state.battery;
        state.battery = Percentage::new(level.0);
        let signal = state.signal;
        self.threshold_events(prev, state.battery, signal, signal);
    }

    pub async fn set_signal(&self, level: Percentage) {
        let mut state = self.state.lock().await;
        let prev = state.signal;
        state.signal = Percentage::new(level.0);
        let battery = state.battery;
        self.threshold_events(battery, battery, prev, state.signal);
    }

    pub async fn adjust_signal(&self, delta: i16) {
        let mut state = self.state.lock().await;
        let prev = state.signal;
        state.signal = prev.adjust(delta);
        let battery = state.battery;
        self.threshold_events(battery, battery, prev, state.signal);
    }

    /// Tear the device down: cancel every task derived from this device and
    /// drop the broker session. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.stop_heartbeat();
        {
            let mut state = self.state.lock().await;
            state.connected = false;
            state.active = false;
        }
        if let Err(e) = self.broker.disconnect(&self.client_id()).await {
            warn!(device_id = %self.config.id, error = %e, "Broker disconnect failed");
        }
        debug!(device_id = %self.config.id, "Device shut down");
    }
}

/// A fleet-managed device of any variant.
#[derive(Clone)]
pub enum Device {
    Button(Arc<Button>),
    Smartwatch(Arc<Smartwatch>),
    Repeater(Arc<Repeater>),
}

impl Device {
    pub fn core(&self) -> &Arc<DeviceCore> {
        match self {
            Device::Button(d) => d.core(),
            Device::Smartwatch(d) => d.core(),
            Device::Repeater(d) => d.core(),
        }
    }

    pub fn id(&self) -> &DeviceId {
        self.core().id()
    }

    pub fn kind(&self) -> DeviceKind {
        self.core().kind()
    }

    pub fn recorder(&self) -> &EventRecorder {
        self.core().recorder()
    }

    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.core().connect().await
    }

    pub async fn shutdown(&self) {
        self.core().shutdown().await;
    }

    pub async fn status(&self) -> DeviceStatusSnapshot {
        self.core().status().await
    }

    pub fn as_button(&self) -> Option<&Arc<Button>> {
        match self {
            Device::Button(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_smartwatch(&self) -> Option<&Arc<Smartwatch>> {
        match self {
            Device::Smartwatch(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_repeater(&self) -> Option<&Arc<Repeater>> {
        match self {
            Device::Repeater(d) => Some(d),
            _ => None,
        }
    }
}
