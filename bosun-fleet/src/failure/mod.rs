pub mod scenarios;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bosun_core::{
    DeviceId, DeviceKind, EventKind, FailureKind, FailureScenario, FailureTarget, Percentage,
};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ulid::Ulid;

use crate::config::FleetTiming;
use crate::device::Device;
use crate::device::button::MalfunctionMode;

/// Signal step applied per tick by a signal-loss injector.
const SIGNAL_LOSS_STEP: u8 = 10;

#[derive(Debug, Error)]
pub enum FailureError {
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),
    #[error("failure '{kind}' does not apply to {actual} device {device}")]
    KindMismatch {
        kind: FailureKind,
        device: DeviceId,
        actual: DeviceKind,
    },
    #[error("scenario '{0}' resolved no target devices")]
    NoTargets(Box<str>),
}

/// Public view of one active failure effect.
#[derive(Debug, Clone)]
pub struct ActiveFailureInfo {
    pub device_id: DeviceId,
    pub kind: FailureKind,
    pub scenario: Box<str>,
    pub started_at: jiff::Timestamp,
}

struct ActiveFailure {
    /// Distinguishes this installation from a replacement under the same
    /// key, so a finished injector only removes its own entry.
    handle_id: Ulid,
    scenario: Box<str>,
    started_at: jiff::Timestamp,
    token: CancellationToken,
}

struct Inner {
    devices: HashMap<DeviceId, Device>,
    active: HashMap<(DeviceId, FailureKind), ActiveFailure>,
}

/// Translates declarative failure scenarios into cancellable effects.
///
/// Every active effect is keyed by (device id, failure kind): re-invoking the
/// same kind on the same device cancels the previous effect before installing
/// the new one, so repeated triggering never accumulates timers. Injector
/// tokens are children of the device's own token, so device teardown cancels
/// them as well.
pub struct FailureSimulator {
    inner: Arc<Mutex<Inner>>,
    timing: FleetTiming,
}

impl FailureSimulator {
    pub fn new(timing: FleetTiming) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                devices: HashMap::new(),
                active: HashMap::new(),
            })),
            timing,
        }
    }

    pub async fn register(&self, device: Device) {
        let mut inner = self.inner.lock().await;
        inner.devices.insert(device.id().clone(), device);
    }

    /// Remove a device and cancel all of its active effects, whatever kind.
    pub async fn unregister(&self, device_id: &DeviceId) {
        let mut inner = self.inner.lock().await;
        inner.devices.remove(device_id);
        let keys: Vec<_> = inner
            .active
            .keys()
            .filter(|(id, _)| id == device_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(active) = inner.active.remove(&key) {
                active.token.cancel();
            }
        }
    }

    pub async fn registered_count(&self) -> usize {
        self.inner.lock().await.devices.len()
    }

    pub async fn active_failures(&self) -> Vec<ActiveFailureInfo> {
        let inner = self.inner.lock().await;
        inner
            .active
            .iter()
            .map(|((device_id, kind), active)| ActiveFailureInfo {
                device_id: device_id.clone(),
                kind: *kind,
                scenario: active.scenario.clone(),
                started_at: active.started_at,
            })
            .collect()
    }

    pub async fn device_failures(&self, device_id: &DeviceId) -> Vec<ActiveFailureInfo> {
        self.active_failures()
            .await
            .into_iter()
            .filter(|f| &f.device_id == device_id)
            .collect()
    }

    /// Stop one effect. Stopping an effect that is not active is harmless.
    pub async fn stop(&self, device_id: &DeviceId, kind: FailureKind) -> bool {
        let (entry, device) = {
            let mut inner = self.inner.lock().await;
            let entry = inner.active.remove(&(device_id.clone(), kind));
            (entry, inner.devices.get(device_id).cloned())
        };
        match entry {
            Some(active) => {
                active.token.cancel();
                if let Some(device) = device {
                    device.recorder().record(
                        EventKind::FailureStopped,
                        json!({ "kind": kind.as_str(), "scenario": active.scenario }),
                    );
                }
                info!(device_id = %device_id, kind = %kind, "Failure stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every active effect on one device.
    pub async fn stop_device(&self, device_id: &DeviceId) -> usize {
        let kinds: Vec<FailureKind> = self
            .device_failures(device_id)
            .await
            .into_iter()
            .map(|f| f.kind)
            .collect();
        let mut stopped = 0;
        for kind in kinds {
            if self.stop(device_id, kind).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Stop every active effect fleet-wide.
    pub async fn stop_all(&self) -> usize {
        let failures = self.active_failures().await;
        let mut stopped = 0;
        for failure in failures {
            if self.stop(&failure.device_id, failure.kind).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Execute a scenario against its resolved targets.
    ///
    /// Explicit target ids must exist and match the failure's applicable
    /// device kind; an `all` target silently narrows to applicable devices.
    pub async fn execute(
        &self,
        scenario: &FailureScenario,
    ) -> Result<Vec<ActiveFailureInfo>, FailureError> {
        let (targets, explicit) = {
            let inner = self.inner.lock().await;
            match &scenario.target {
                FailureTarget::Devices(ids) => {
                    let mut targets = Vec::with_capacity(ids.len());
                    for id in ids {
                        let device = inner
                            .devices
                            .get(id)
                            .cloned()
                            .ok_or_else(|| FailureError::UnknownDevice(id.clone()))?;
                        targets.push(device);
                    }
                    (targets, true)
                }
                FailureTarget::All(_) => (inner.devices.values().cloned().collect(), false),
            }
        };

        let mut applicable = Vec::with_capacity(targets.len());
        for device in targets {
            match kind_applies(scenario.kind, &device) {
                true => applicable.push(device),
                false if explicit => {
                    return Err(FailureError::KindMismatch {
                        kind: scenario.kind,
                        device: device.id().clone(),
                        actual: device.kind(),
                    });
                }
                false => {}
            }
        }
        if applicable.is_empty() {
            return Err(FailureError::NoTargets(scenario.name.clone()));
        }

        let mut installed = Vec::with_capacity(applicable.len());
        for device in applicable {
            installed.push(self.apply(&device, scenario).await);
        }
        Ok(installed)
    }

    async fn apply(&self, device: &Device, scenario: &FailureScenario) -> ActiveFailureInfo {
        let key = (device.id().clone(), scenario.kind);
        let token = device.core().child_token();
        let handle_id = Ulid::new();
        let started_at = jiff::Timestamp::now();

        {
            let mut inner = self.inner.lock().await;
            if let Some(prev) = inner.active.insert(
                key.clone(),
                ActiveFailure {
                    handle_id,
                    scenario: scenario.name.clone(),
                    started_at,
                    token: token.clone(),
                },
            ) {
                prev.token.cancel();
                debug!(device_id = %key.0, kind = %key.1, "Replaced prior failure handle");
            }
        }

        device.recorder().record(
            EventKind::FailureStarted,
            json!({
                "kind": scenario.kind.as_str(),
                "scenario": scenario.name,
                "severity": scenario.severity,
            }),
        );
        info!(
            device_id = %device.id(),
            kind = %scenario.kind,
            scenario = %scenario.name,
            "Failure applied"
        );

        self.spawn_injector(device.clone(), scenario.clone(), token, handle_id)
            .await;

        ActiveFailureInfo {
            device_id: key.0,
            kind: key.1,
            scenario: scenario.name.clone(),
            started_at,
        }
    }

    async fn spawn_injector(
        &self,
        device: Device,
        scenario: FailureScenario,
        token: CancellationToken,
        handle_id: Ulid,
    ) {
        let inner = Arc::clone(&self.inner);
        let timing = self.timing;
        let key = (device.id().clone(), scenario.kind);

        match scenario.kind {
            FailureKind::BatteryDrain => {
                let core = Arc::clone(device.core());
                let target = Percentage::new(scenario.param_u64("target_level", 5) as u8);
                let instant = scenario.param_bool("instant", false);
                let rate = scenario
                    .param_u64("drain_rate", (scenario.severity.factor() * 5.0).ceil() as u64)
                    .max(1) as u8;
                tokio::spawn(async move {
                    if instant {
                        core.set_battery(target).await;
                        core.publish_status().await;
                        remove_if_current(&inner, &key, handle_id).await;
                        return;
                    }
                    let mut interval = tokio::time::interval(timing.failure_tick());
                    interval.tick().await;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = interval.tick() => {
                                core.drain_battery(rate).await;
                                if core.battery().await <= target {
                                    core.set_battery(target).await;
                                    core.publish_status().await;
                                    break;
                                }
                            }
                        }
                    }
                    remove_if_current(&inner, &key, handle_id).await;
                });
            }
            FailureKind::SignalLoss => {
                let core = Arc::clone(device.core());
                let floor = scenario.severity.signal_floor();
                let duration = scenario.duration();
                tokio::spawn(async move {
                    // Restored value is the pre-scenario signal.
                    let original = core.signal().await;
                    let deadline = duration.map(|d| tokio::time::Instant::now() + d);
                    let mut interval = tokio::time::interval(timing.failure_tick());
                    interval.tick().await;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = deadline_or_never(deadline) => {
                                core.set_signal(original).await;
                                core.publish_status().await;
                                break;
                            }
                            _ = interval.tick() => {
                                let current = core.signal().await;
                                if current > floor {
                                    let next = current.0.saturating_sub(SIGNAL_LOSS_STEP).max(floor.0);
                                    core.set_signal(Percentage::new(next)).await;
                                }
                            }
                        }
                    }
                    remove_if_current(&inner, &key, handle_id).await;
                });
            }
            FailureKind::DeviceOffline => {
                let core = Arc::clone(device.core());
                let duration = scenario.duration();
                tokio::spawn(async move {
                    core.simulate_offline(duration).await;
                    match duration {
                        Some(d) => {
                            tokio::select! {
                                _ = token.cancelled() => return,
                                _ = tokio::time::sleep(d) => {}
                            }
                            remove_if_current(&inner, &key, handle_id).await;
                        }
                        // No duration: the handle lives until explicitly
                        // stopped; the device stays offline either way until
                        // reconnected.
                        None => token.cancelled().await,
                    }
                });
            }
            FailureKind::IntermittentConnection => {
                let core = Arc::clone(device.core());
                let gap = Duration::from_millis(
                    scenario.param_u64("interval_ms", timing.failure_tick_ms * 3),
                );
                let offline = Duration::from_millis(
                    scenario.param_u64("offline_ms", timing.failure_tick_ms),
                );
                let duration = scenario.duration();
                tokio::spawn(async move {
                    let deadline = duration.map(|d| tokio::time::Instant::now() + d);
                    let mut interval = tokio::time::interval(gap);
                    interval.tick().await;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = deadline_or_never(deadline) => {
                                core.simulate_online().await;
                                break;
                            }
                            _ = interval.tick() => {
                                core.simulate_offline(Some(offline)).await;
                            }
                        }
                    }
                    remove_if_current(&inner, &key, handle_id).await;
                });
            }
            FailureKind::ButtonMalfunction => {
                // Applicability was checked before installing the handle.
                let Some(button) = device.as_button().cloned() else {
                    return;
                };
                let mode = match scenario.param_str("mode", "unresponsive") {
                    "stuck" => MalfunctionMode::Stuck,
                    _ => MalfunctionMode::Unresponsive,
                };
                let window = scenario
                    .duration()
                    .unwrap_or(timing.unresponsive_window());
                button.simulate_malfunction(mode).await;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            button.simulate_malfunction(MalfunctionMode::Normal).await;
                            return;
                        }
                        _ = tokio::time::sleep(window) => {
                            button.simulate_malfunction(MalfunctionMode::Normal).await;
                        }
                    }
                    remove_if_current(&inner, &key, handle_id).await;
                });
            }
            FailureKind::NetworkCongestion => {
                let Some(repeater) = device.as_repeater().cloned() else {
                    return;
                };
                let count = scenario
                    .param_u64("message_count", (50.0 * scenario.severity.factor()) as u64)
                    .max(1) as u32;
                let duration = scenario
                    .duration()
                    .unwrap_or(timing.failure_tick() * 10);
                repeater.simulate_congestion(count, duration).await;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(duration) => {}
                    }
                    remove_if_current(&inner, &key, handle_id).await;
                });
            }
            FailureKind::FirmwareCrash => {
                let core = Arc::clone(device.core());
                let reboot = timing.reboot();
                let cause = scenario.param_str("cause", "firmware_fault").to_owned();
                tokio::spawn(async move {
                    core.simulate_offline(None).await;
                    core.recorder()
                        .record(EventKind::FirmwareCrash, json!({ "cause": cause }));
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(reboot) => {}
                    }
                    core.simulate_online().await;
                    core.recorder()
                        .record(EventKind::FirmwareRecovery, json!({ "cause": cause }));
                    remove_if_current(&inner, &key, handle_id).await;
                });
            }
            FailureKind::MemoryLeak => {
                let core = Arc::clone(device.core());
                let rate = scenario
                    .param_u64("leak_rate", (10.0 * scenario.severity.factor()) as u64)
                    .max(1) as u8;
                let start = scenario.param_u64("start_percent", 30).min(99) as u8;
                let reboot = timing.reboot();
                tokio::spawn(async move {
                    let mut usage = start;
                    let mut interval = tokio::time::interval(timing.failure_tick());
                    interval.tick().await;
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = interval.tick() => {
                                usage = usage.saturating_add(rate).min(100);
                                core.recorder().record(
                                    EventKind::MemoryUsage,
                                    json!({ "usage_percent": usage }),
                                );
                                core.publish(
                                    "notification",
                                    json!({ "memory_usage_percent": usage }),
                                )
                                .await;
                                if usage >= 100 {
                                    core.simulate_offline(None).await;
                                    core.recorder().record(
                                        EventKind::FirmwareCrash,
                                        json!({ "cause": "out_of_memory" }),
                                    );
                                    tokio::select! {
                                        _ = token.cancelled() => return,
                                        _ = tokio::time::sleep(reboot) => {}
                                    }
                                    core.simulate_online().await;
                                    core.recorder().record(
                                        EventKind::FirmwareRecovery,
                                        json!({ "cause": "out_of_memory" }),
                                    );
                                    break;
                                }
                            }
                        }
                    }
                    remove_if_current(&inner, &key, handle_id).await;
                });
            }
        }
    }
}

impl Clone for FailureSimulator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            timing: self.timing,
        }
    }
}

fn kind_applies(kind: FailureKind, device: &Device) -> bool {
    match kind {
        FailureKind::ButtonMalfunction => device.as_button().is_some(),
        FailureKind::NetworkCongestion => device.as_repeater().is_some(),
        _ => true,
    }
}

/// Sleep until the deadline, or forever when there is none.
async fn deadline_or_never(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Remove a finished injector's handle, but only if it has not been replaced
/// by a newer installation under the same key.
async fn remove_if_current(
    inner: &Arc<Mutex<Inner>>,
    key: &(DeviceId, FailureKind),
    handle_id: Ulid,
) {
    let mut guard = inner.lock().await;
    if guard
        .active
        .get(key)
        .is_some_and(|active| active.handle_id == handle_id)
    {
        guard.active.remove(key);
    }
}
