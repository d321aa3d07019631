use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bosun_core::{Dbm, DeviceId, EventKind, SignalQuality};
use rand::Rng;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::FleetTiming;

use super::{DeviceConfig, DeviceCore};

/// Simulated propagation delay bounds for a relayed message.
const RELAY_DELAY_MS: std::ops::Range<u64> = 50..150;
/// Default mesh signal strength for a fresh repeater.
const DEFAULT_DBM: i16 = -55;
/// Largest RSSI penalty a peer link can have relative to the repeater.
const PEER_RSSI_SPREAD: i16 = 20;
/// Signal drop applied by a critical-severity interference event.
const INTERFERENCE_MAX_DROP: i16 = 40;

#[derive(Debug, Clone)]
pub struct PeerLink {
    pub last_seen: jiff::Timestamp,
    pub rssi: Dbm,
}

struct RepeaterState {
    dbm: Dbm,
    peers: HashMap<DeviceId, PeerLink>,
    relayed_count: u64,
    last_relay: Option<jiff::Timestamp>,
    firmware: Box<str>,
    uptime_started: tokio::time::Instant,
    interference: Option<CancellationToken>,
}

/// Radio mesh repeater: peer table, message relay, firmware lifecycle.
///
/// Mesh signal strength uses a dBm scale clamped to a realistic band, on top
/// of the percentage signal the base capability tracks.
pub struct Repeater {
    core: Arc<DeviceCore>,
    state: Mutex<RepeaterState>,
}

/// Deterministic RSSI estimate for a peer: a stable per-id penalty below the
/// repeater's own strength, so tests are reproducible.
fn estimate_rssi(peer: &DeviceId, own: Dbm) -> Dbm {
    let hash = peer
        .as_str()
        .bytes()
        .fold(0u16, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u16));
    Dbm::new(own.0 - (hash % PEER_RSSI_SPREAD as u16) as i16 - 1)
}

impl Repeater {
    pub fn new(config: DeviceConfig, broker: Arc<dyn Broker>, timing: FleetTiming) -> Arc<Self> {
        Arc::new(Self {
            core: DeviceCore::new(config, broker, timing),
            state: Mutex::new(RepeaterState {
                dbm: Dbm::new(DEFAULT_DBM),
                peers: HashMap::new(),
                relayed_count: 0,
                last_relay: None,
                firmware: "1.0.0".into(),
                uptime_started: tokio::time::Instant::now(),
                interference: None,
            }),
        })
    }

    pub fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }

    pub async fn signal_dbm(&self) -> Dbm {
        self.state.lock().await.dbm
    }

    pub async fn signal_quality(&self) -> SignalQuality {
        SignalQuality::from_dbm(self.state.lock().await.dbm)
    }

    pub async fn peers(&self) -> HashMap<DeviceId, PeerLink> {
        self.state.lock().await.peers.clone()
    }

    pub async fn relayed_count(&self) -> u64 {
        self.state.lock().await.relayed_count
    }

    pub async fn firmware_version(&self) -> Box<str> {
        self.state.lock().await.firmware.clone()
    }

    pub async fn uptime(&self) -> Duration {
        self.state.lock().await.uptime_started.elapsed()
    }

    /// Add a peer to the relay table with a deterministic RSSI estimate.
    pub async fn register_peer(self: &Arc<Self>, peer: DeviceId) {
        let rssi = {
            let mut state = self.state.lock().await;
            let rssi = estimate_rssi(&peer, state.dbm);
            state.peers.insert(
                peer.clone(),
                PeerLink {
                    last_seen: jiff::Timestamp::now(),
                    rssi,
                },
            );
            rssi
        };
        self.core
            .publish_repeater(
                "device/connected",
                json!({ "peer": peer.as_str(), "rssi_dbm": rssi.0 }),
            )
            .await;
        self.core.recorder().record(
            EventKind::PeerConnected,
            json!({ "peer": peer.as_str(), "rssi_dbm": rssi.0 }),
        );
    }

    pub async fn unregister_peer(self: &Arc<Self>, peer: &DeviceId) {
        let removed = self.state.lock().await.peers.remove(peer).is_some();
        if !removed {
            return;
        }
        self.core
            .publish_repeater("device/disconnected", json!({ "peer": peer.as_str() }))
            .await;
        self.core
            .recorder()
            .record(EventKind::PeerDisconnected, json!({ "peer": peer.as_str() }));
    }

    /// Forward a message between two peers. The relayed envelope is published
    /// after a randomized propagation delay with the hop count incremented.
    pub async fn relay_message(
        self: &Arc<Self>,
        from: DeviceId,
        to: DeviceId,
        message: serde_json::Value,
    ) {
        let hop_count = message.get("hop_count").and_then(|v| v.as_u64()).unwrap_or(0);
        let delay = Duration::from_millis(rand::rng().random_range(RELAY_DELAY_MS));

        let repeater = Arc::clone(self);
        let cancel = self.core.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    {
                        let mut state = repeater.state.lock().await;
                        state.relayed_count += 1;
                        state.last_relay = Some(jiff::Timestamp::now());
                        if let Some(link) = state.peers.get_mut(&from) {
                            link.last_seen = jiff::Timestamp::now();
                        }
                    }
                    repeater
                        .core
                        .publish_repeater(
                            "relay",
                            json!({
                                "from": from.as_str(),
                                "to": to.as_str(),
                                "message": message,
                                "hop_count": hop_count + 1,
                            }),
                        )
                        .await;
                    repeater.core.recorder().record(
                        EventKind::Relay,
                        json!({
                            "from": from.as_str(),
                            "to": to.as_str(),
                            "hop_count": hop_count + 1,
                        }),
                    );
                }
            }
        });
    }

    /// Adjust mesh signal strength and publish the resulting classification.
    pub async fn update_signal_strength(self: &Arc<Self>, delta: i16) {
        let (dbm, quality) = {
            let mut state = self.state.lock().await;
            state.dbm = state.dbm.adjust(delta);
            (state.dbm, SignalQuality::from_dbm(state.dbm))
        };
        self.core
            .publish_repeater(
                "signal",
                json!({ "dbm": dbm.0, "quality": quality.as_str() }),
            )
            .await;
        self.core.recorder().record(
            EventKind::Signal,
            json!({ "dbm": dbm.0, "quality": quality.as_str() }),
        );
    }

    /// Apply a temporary signal drop sized by severity, restoring the
    /// pre-interference value once the duration elapses.
    pub async fn simulate_interference(
        self: &Arc<Self>,
        duration: Duration,
        severity: bosun_core::FailureSeverity,
    ) {
        let token = self.core.child_token();
        let prior = {
            let mut state = self.state.lock().await;
            if let Some(prev) = state.interference.replace(token.clone()) {
                prev.cancel();
            }
            let prior = state.dbm;
            let drop = (severity.factor() * INTERFERENCE_MAX_DROP as f64) as i16;
            state.dbm = state.dbm.adjust(-drop);
            prior
        };

        self.core.recorder().record(
            EventKind::Interference,
            json!({ "duration_ms": duration.as_millis() as u64 }),
        );
        self.core
            .publish_repeater(
                "interference",
                json!({ "active": true, "duration_ms": duration.as_millis() as u64 }),
            )
            .await;
        warn!(device_id = %self.core.id(), ?duration, "Interference started");

        let repeater = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    {
                        let mut state = repeater.state.lock().await;
                        state.dbm = prior;
                        state.interference = None;
                    }
                    repeater
                        .core
                        .publish_repeater("interference", json!({ "active": false }))
                        .await;
                }
            }
        });
    }

    /// Flood synthetic relay traffic at a fixed cadence until the duration
    /// elapses.
    pub async fn simulate_congestion(self: &Arc<Self>, message_count: u32, duration: Duration) {
        self.core.recorder().record(
            EventKind::Congestion,
            json!({
                "message_count": message_count,
                "duration_ms": duration.as_millis() as u64,
            }),
        );
        self.core
            .publish_repeater(
                "congestion",
                json!({ "active": true, "message_count": message_count }),
            )
            .await;

        let cadence = duration
            .checked_div(message_count.max(1))
            .unwrap_or(Duration::from_millis(10))
            .max(Duration::from_millis(1));

        let repeater = Arc::clone(self);
        let cancel = self.core.child_token();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + duration;
            let mut interval = tokio::time::interval(cadence);
            interval.tick().await;
            for seq in 0..message_count {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = interval.tick() => {
                        repeater
                            .relay_message(
                                DeviceId::from("SIM-TRAFFIC-SRC"),
                                DeviceId::from("SIM-TRAFFIC-DST"),
                                json!({ "seq": seq, "synthetic": true }),
                            )
                            .await;
                    }
                }
            }
        });
    }

    /// Evict peers not seen within the age window.
    pub async fn cleanup_stale_peers(self: &Arc<Self>, max_age: Duration) -> usize {
        let cutoff = jiff::Timestamp::now()
            - jiff::Span::new().milliseconds(max_age.as_millis() as i64);
        let evicted: Vec<DeviceId> = {
            let mut state = self.state.lock().await;
            let stale: Vec<DeviceId> = state
                .peers
                .iter()
                .filter(|(_, link)| link.last_seen < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                state.peers.remove(id);
            }
            stale
        };

        if !evicted.is_empty() {
            self.core
                .publish_repeater(
                    "mesh",
                    json!({ "evicted": evicted.iter().map(|d| d.as_str()).collect::<Vec<_>>() }),
                )
                .await;
            for peer in &evicted {
                self.core
                    .recorder()
                    .record(EventKind::PeerDisconnected, json!({ "peer": peer.as_str(), "reason": "stale" }));
            }
        }
        evicted.len()
    }

    /// Run the multi-phase firmware update sequence: download progress ticks,
    /// install, a fixed reboot delay, then completion. The reported firmware
    /// version changes and the uptime counter resets.
    pub async fn simulate_firmware_update(self: &Arc<Self>, version: &str, duration: Duration) {
        info!(device_id = %self.core.id(), version, "Firmware update started");
        let repeater = Arc::clone(self);
        let cancel = self.core.child_token();
        let version = version.to_owned();
        let reboot = self.core.timing().reboot();
        let phase_delay = (duration / 5).max(Duration::from_millis(1));

        tokio::spawn(async move {
            for progress in [25u8, 50, 75, 100] {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(phase_delay) => {}
                }
                repeater
                    .core
                    .publish_repeater(
                        "firmware/update",
                        json!({ "phase": "downloading", "progress": progress }),
                    )
                    .await;
                repeater.core.recorder().record(
                    EventKind::FirmwareUpdate,
                    json!({ "phase": "downloading", "progress": progress }),
                );
            }

            repeater
                .core
                .publish_repeater("firmware/update", json!({ "phase": "installing" }))
                .await;
            repeater
                .core
                .recorder()
                .record(EventKind::FirmwareUpdate, json!({ "phase": "installing" }));

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(reboot) => {}
            }

            {
                let mut state = repeater.state.lock().await;
                state.firmware = version.clone().into_boxed_str();
                state.uptime_started = tokio::time::Instant::now();
            }
            repeater
                .core
                .publish_repeater(
                    "firmware/update",
                    json!({ "phase": "completed", "version": version }),
                )
                .await;
            repeater.core.recorder().record(
                EventKind::FirmwareUpdate,
                json!({ "phase": "completed", "version": version }),
            );
            info!(device_id = %repeater.core.id(), version, "Firmware update completed");
        });
    }
}
