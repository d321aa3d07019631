use std::sync::Arc;
use std::time::Duration;

use bosun_core::{EventKind, Percentage};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::FleetTiming;

use super::{DeviceConfig, DeviceCore};

/// Battery drained by a single press.
const PRESS_DRAIN: u8 = 1;
/// Presses fired by a stuck-button burst.
const STUCK_BURST_COUNT: u32 = 10;

/// Press behavior mode. Malfunction is an explicit mode checked at the top of
/// `press`, not a swapped handler, so it stays statically analyzable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalfunctionMode {
    Normal,
    Stuck,
    Unresponsive,
}

#[derive(Debug, Clone, Default)]
pub struct PressOptions {
    pub long_press: bool,
    pub emergency: bool,
    pub transcript: Option<String>,
}

struct ButtonState {
    press_count: u64,
    last_press: Option<jiff::Timestamp>,
    mode: MalfunctionMode,
}

/// Wall-mounted emergency call button.
pub struct Button {
    core: Arc<DeviceCore>,
    state: Mutex<ButtonState>,
}

impl Button {
    pub fn new(config: DeviceConfig, broker: Arc<dyn Broker>, timing: FleetTiming) -> Arc<Self> {
        Arc::new(Self {
            core: DeviceCore::new(config, broker, timing),
            state: Mutex::new(ButtonState {
                press_count: 0,
                last_press: None,
                mode: MalfunctionMode::Normal,
            }),
        })
    }

    pub fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }

    pub async fn press_count(&self) -> u64 {
        self.state.lock().await.press_count
    }

    pub async fn malfunction_mode(&self) -> MalfunctionMode {
        self.state.lock().await.mode
    }

    /// Register a press. An unresponsive button only records `press_failed`;
    /// that models a physically broken switch, not an error.
    pub async fn press(self: &Arc<Self>, options: PressOptions) {
        let count = {
            let mut state = self.state.lock().await;
            if state.mode == MalfunctionMode::Unresponsive {
                drop(state);
                self.core
                    .recorder()
                    .record(EventKind::PressFailed, json!({ "reason": "unresponsive" }));
                return;
            }
            state.press_count += 1;
            state.last_press = Some(jiff::Timestamp::now());
            state.press_count
        };

        self.core.drain_battery(PRESS_DRAIN).await;

        let press_type = if options.long_press { "long" } else { "short" };
        self.core
            .publish(
                "press",
                json!({
                    "press_type": press_type,
                    "emergency": options.emergency,
                    "press_count": count,
                    "has_transcript": options.transcript.is_some(),
                }),
            )
            .await;
        self.core.recorder().record(
            EventKind::Press,
            json!({
                "press_type": press_type,
                "emergency": options.emergency,
                "press_count": count,
            }),
        );

        if options.emergency {
            info!(device_id = %self.core.id(), "Emergency press");
        }

        // Transcripts go through a simulated speech-processing delay before
        // the voice message is published.
        if let Some(transcript) = options.transcript {
            let core = Arc::clone(&self.core);
            let cancel = self.core.child_token();
            let delay = self.core.timing().voice_processing();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        core.publish("voice", json!({ "transcript": transcript })).await;
                        core.recorder()
                            .record(EventKind::VoiceMessage, json!({ "transcript": transcript }));
                    }
                }
            });
        }

        self.core.publish_status().await;
    }

    /// Drive `count` presses on a fixed cadence. Fire-and-forget; the burst
    /// is cancelled by device teardown.
    pub fn rapid_press(self: &Arc<Self>, count: u32, interval: Duration) {
        let button = Arc::clone(self);
        let cancel = self.core.child_token();
        tokio::spawn(async move {
            for _ in 0..count {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        button.press(PressOptions::default()).await;
                    }
                }
            }
        });
    }

    pub async fn emergency_press(self: &Arc<Self>, message: Option<String>) {
        self.press(PressOptions {
            long_press: true,
            emergency: true,
            transcript: message,
        })
        .await;
    }

    /// Put the button into a malfunction mode. `Stuck` fires a burst of rapid
    /// presses; `Unresponsive` suppresses presses until the window elapses.
    pub async fn simulate_malfunction(self: &Arc<Self>, mode: MalfunctionMode) {
        {
            let mut state = self.state.lock().await;
            state.mode = mode;
        }
        warn!(device_id = %self.core.id(), ?mode, "Button malfunction");

        match mode {
            MalfunctionMode::Normal => {}
            MalfunctionMode::Stuck => {
                self.rapid_press(STUCK_BURST_COUNT, self.core.timing().failure_tick());
            }
            MalfunctionMode::Unresponsive => {
                let button = Arc::clone(self);
                let cancel = self.core.child_token();
                let window = self.core.timing().unresponsive_window();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(window) => {
                            let mut state = button.state.lock().await;
                            if state.mode == MalfunctionMode::Unresponsive {
                                state.mode = MalfunctionMode::Normal;
                            }
                        }
                    }
                });
            }
        }
    }

    /// Simulated recharge: battery back to full.
    pub async fn recharge(&self) {
        self.core.set_battery(Percentage(100)).await;
    }
}
