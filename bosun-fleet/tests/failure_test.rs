use std::sync::Arc;
use std::time::Duration;

use bosun_core::{
    DeviceId, DeviceKind, EventKind, FailureKind, FailureScenario, FailureSeverity, FailureTarget,
    Percentage,
};
use bosun_fleet::broker::memory::MemoryBroker;
use bosun_fleet::config::FleetTiming;
use bosun_fleet::device::button::{Button, MalfunctionMode};
use bosun_fleet::device::repeater::Repeater;
use bosun_fleet::device::watch::Smartwatch;
use bosun_fleet::device::{Device, DeviceConfig};
use bosun_fleet::failure::{FailureError, FailureSimulator, scenarios};

/// Fast timings with the heartbeat parked so battery and signal levels only
/// move when an injector moves them.
fn timing() -> FleetTiming {
    FleetTiming {
        heartbeat_ms: 600_000,
        ..FleetTiming::fast()
    }
}

fn config(kind: DeviceKind) -> DeviceConfig {
    DeviceConfig {
        id: DeviceId::generate(kind),
        name: "Test Device".into(),
        kind,
        location: "Salon".into(),
        namespace: "test".into(),
        battery: Percentage(100),
        signal: Percentage(85),
    }
}

async fn button_fixture(timing: FleetTiming) -> (FailureSimulator, Arc<Button>) {
    let broker = Arc::new(MemoryBroker::new());
    let button = Button::new(config(DeviceKind::Button), broker, timing);
    button.core().connect().await.unwrap();
    let simulator = FailureSimulator::new(timing);
    simulator.register(Device::Button(button.clone())).await;
    (simulator, button)
}

async fn repeater_fixture(timing: FleetTiming) -> (FailureSimulator, Arc<Repeater>) {
    let broker = Arc::new(MemoryBroker::new());
    let repeater = Repeater::new(config(DeviceKind::Repeater), broker, timing);
    repeater.core().connect().await.unwrap();
    let simulator = FailureSimulator::new(timing);
    simulator.register(Device::Repeater(repeater.clone())).await;
    (simulator, repeater)
}

fn scenario(
    kind: FailureKind,
    severity: FailureSeverity,
    duration_ms: Option<u64>,
    params: serde_json::Value,
) -> FailureScenario {
    FailureScenario {
        name: "test_scenario".into(),
        kind,
        target: FailureTarget::all(),
        severity,
        duration_ms,
        params,
    }
}

#[tokio::test]
async fn battery_drain_reaches_target_and_clears() {
    let (simulator, button) = button_fixture(timing()).await;

    let s = scenario(
        FailureKind::BatteryDrain,
        FailureSeverity::Critical,
        None,
        serde_json::json!({ "target_level": 90, "drain_rate": 5 }),
    );
    let installed = simulator.execute(&s).await.unwrap();
    assert_eq!(installed.len(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(button.core().battery().await, Percentage(90));
    // A completed injector removes its own handle.
    assert!(simulator.active_failures().await.is_empty());
}

#[tokio::test]
async fn signal_loss_restores_prior_value() {
    let (simulator, button) = button_fixture(timing()).await;

    let s = scenario(
        FailureKind::SignalLoss,
        FailureSeverity::High,
        Some(120),
        serde_json::json!({}),
    );
    simulator.execute(&s).await.unwrap();

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(button.core().signal().await < Percentage(85));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(button.core().signal().await, Percentage(85));
    assert!(simulator.active_failures().await.is_empty());
}

#[tokio::test]
async fn explicit_target_must_match_device_kind() {
    let timing = timing();
    let broker = Arc::new(MemoryBroker::new());
    let watch = Smartwatch::new(config(DeviceKind::Smartwatch), broker, timing);
    watch.core().connect().await.unwrap();
    let simulator = FailureSimulator::new(timing);
    simulator.register(Device::Smartwatch(watch.clone())).await;

    let mut s = scenario(
        FailureKind::ButtonMalfunction,
        FailureSeverity::High,
        None,
        serde_json::json!({}),
    );
    s.target = FailureTarget::Devices(vec![watch.core().id().clone()]);
    assert!(matches!(
        simulator.execute(&s).await,
        Err(FailureError::KindMismatch { .. })
    ));

    // An `all` target silently narrows; with no applicable device it is an
    // empty scenario.
    s.target = FailureTarget::all();
    assert!(matches!(
        simulator.execute(&s).await,
        Err(FailureError::NoTargets(_))
    ));

    let unknown = DeviceId::from("BTN-2026-ZZZZZZ");
    s.target = FailureTarget::Devices(vec![unknown]);
    assert!(matches!(
        simulator.execute(&s).await,
        Err(FailureError::UnknownDevice(_))
    ));
}

#[tokio::test]
async fn retriggering_replaces_the_active_handle() {
    let (simulator, button) = button_fixture(timing()).await;

    let s = scenario(
        FailureKind::SignalLoss,
        FailureSeverity::Low,
        None,
        serde_json::json!({}),
    );
    simulator.execute(&s).await.unwrap();
    simulator.execute(&s).await.unwrap();

    let active = simulator.active_failures().await;
    assert_eq!(active.len(), 1);
    assert_eq!(&active[0].device_id, button.core().id());
    assert_eq!(
        button
            .core()
            .recorder()
            .events_of(EventKind::FailureStarted)
            .len(),
        2
    );
}

#[tokio::test]
async fn stop_cancels_the_effect_and_records_it() {
    let (simulator, button) = button_fixture(timing()).await;

    let s = scenario(
        FailureKind::SignalLoss,
        FailureSeverity::Critical,
        None,
        serde_json::json!({}),
    );
    simulator.execute(&s).await.unwrap();
    assert_eq!(simulator.active_failures().await.len(), 1);

    assert!(simulator.stop(button.core().id(), FailureKind::SignalLoss).await);
    assert!(simulator.active_failures().await.is_empty());
    assert_eq!(
        button
            .core()
            .recorder()
            .events_of(EventKind::FailureStopped)
            .len(),
        1
    );

    // Stopping again is harmless.
    assert!(!simulator.stop(button.core().id(), FailureKind::SignalLoss).await);
}

#[tokio::test]
async fn device_offline_restores_after_duration() {
    let (simulator, button) = button_fixture(timing()).await;

    let s = scenario(
        FailureKind::DeviceOffline,
        FailureSeverity::Critical,
        Some(80),
        serde_json::json!({}),
    );
    simulator.execute(&s).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!button.core().is_connected().await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(button.core().is_connected().await);
    assert!(simulator.active_failures().await.is_empty());
}

#[tokio::test]
async fn retriggered_offline_scenario_replaces_the_duration() {
    let (simulator, button) = button_fixture(timing()).await;

    let short = scenario(
        FailureKind::DeviceOffline,
        FailureSeverity::Critical,
        Some(100),
        serde_json::json!({}),
    );
    simulator.execute(&short).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    // Re-executing the same kind must supersede the first deadline.
    let long = scenario(
        FailureKind::DeviceOffline,
        FailureSeverity::Critical,
        Some(1_000),
        serde_json::json!({}),
    );
    simulator.execute(&long).await.unwrap();
    assert_eq!(simulator.active_failures().await.len(), 1);

    // Past the first scenario's deadline, still inside the second's.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!button.core().is_connected().await);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(button.core().is_connected().await);
    assert!(simulator.active_failures().await.is_empty());
}

#[tokio::test]
async fn intermittent_connection_ends_online() {
    let (simulator, button) = button_fixture(timing()).await;

    let s = scenario(
        FailureKind::IntermittentConnection,
        FailureSeverity::Medium,
        Some(120),
        serde_json::json!({ "interval_ms": 30, "offline_ms": 15 }),
    );
    simulator.execute(&s).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(button.core().is_connected().await);
    assert!(simulator.active_failures().await.is_empty());
}

#[tokio::test]
async fn stuck_button_fires_presses_then_recovers() {
    let (simulator, button) = button_fixture(timing()).await;

    let s = scenario(
        FailureKind::ButtonMalfunction,
        FailureSeverity::High,
        Some(100),
        serde_json::json!({ "mode": "stuck" }),
    );
    simulator.execute(&s).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(button.press_count().await > 0);
    assert_eq!(button.malfunction_mode().await, MalfunctionMode::Normal);
    assert!(simulator.active_failures().await.is_empty());
}

#[tokio::test]
async fn firmware_crash_recovers_after_reboot() {
    let (simulator, button) = button_fixture(timing()).await;

    let s = scenario(
        FailureKind::FirmwareCrash,
        FailureSeverity::Critical,
        None,
        serde_json::json!({}),
    );
    simulator.execute(&s).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let recorder = button.core().recorder();
    assert_eq!(recorder.events_of(EventKind::FirmwareCrash).len(), 1);
    assert_eq!(recorder.events_of(EventKind::FirmwareRecovery).len(), 1);
    assert!(button.core().is_connected().await);
    assert!(simulator.active_failures().await.is_empty());
}

#[tokio::test]
async fn memory_leak_crashes_at_full_usage() {
    let (simulator, button) = button_fixture(timing()).await;

    let s = scenario(
        FailureKind::MemoryLeak,
        FailureSeverity::Critical,
        None,
        serde_json::json!({ "start_percent": 80, "leak_rate": 20 }),
    );
    simulator.execute(&s).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let recorder = button.core().recorder();
    assert!(!recorder.events_of(EventKind::MemoryUsage).is_empty());
    assert_eq!(recorder.events_of(EventKind::FirmwareCrash).len(), 1);
    assert_eq!(recorder.events_of(EventKind::FirmwareRecovery).len(), 1);
    assert!(button.core().is_connected().await);
    assert!(simulator.active_failures().await.is_empty());
}

#[tokio::test]
async fn congestion_scenario_floods_synthetic_relays() {
    let (simulator, repeater) = repeater_fixture(timing()).await;

    let mut s = scenarios::by_name(scenarios::REPEATER_CONGESTION).unwrap();
    s.duration_ms = Some(200);
    s.params = serde_json::json!({ "message_count": 10 });
    let installed = simulator.execute(&s).await.unwrap();
    assert_eq!(installed.len(), 1);

    // Synthetic relays carry a randomized forwarding delay, so leave room
    // for the last one to land.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(repeater.relayed_count().await > 0);
    assert!(
        !repeater
            .core()
            .recorder()
            .events_of(EventKind::Congestion)
            .is_empty()
    );
    assert!(simulator.active_failures().await.is_empty());

    repeater.core().shutdown().await;
}

#[tokio::test]
async fn unregister_cancels_all_device_effects() {
    let (simulator, button) = button_fixture(timing()).await;

    let signal = scenario(
        FailureKind::SignalLoss,
        FailureSeverity::Low,
        None,
        serde_json::json!({}),
    );
    let drain = scenario(
        FailureKind::BatteryDrain,
        FailureSeverity::Low,
        None,
        serde_json::json!({ "target_level": 0, "drain_rate": 1 }),
    );
    simulator.execute(&signal).await.unwrap();
    simulator.execute(&drain).await.unwrap();
    assert_eq!(simulator.active_failures().await.len(), 2);

    simulator.unregister(button.core().id()).await;
    assert!(simulator.active_failures().await.is_empty());
    assert_eq!(simulator.registered_count().await, 0);
}
