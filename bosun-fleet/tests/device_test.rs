use std::sync::Arc;
use std::time::Duration;

use bosun_core::{
    CrewStatus, Dbm, DeviceId, DeviceKind, EventKind, Percentage, SignalQuality, device_topic,
    repeater_topic,
};
use bosun_fleet::broker::memory::MemoryBroker;
use bosun_fleet::config::FleetTiming;
use bosun_fleet::device::{DeviceConfig, NetworkFailure};
use bosun_fleet::device::button::{Button, MalfunctionMode, PressOptions};
use bosun_fleet::device::repeater::Repeater;
use bosun_fleet::device::watch::{MovementPattern, Smartwatch};

fn config(kind: DeviceKind, name: &str) -> DeviceConfig {
    DeviceConfig {
        id: DeviceId::generate(kind),
        name: name.into(),
        kind,
        location: "Salon".into(),
        namespace: "test".into(),
        battery: Percentage(100),
        signal: Percentage(85),
    }
}

fn setup() -> (Arc<MemoryBroker>, FleetTiming) {
    (Arc::new(MemoryBroker::new()), FleetTiming::fast())
}

/// Fast timings with the heartbeat parked, for exact battery assertions.
fn setup_no_heartbeat() -> (Arc<MemoryBroker>, FleetTiming) {
    let timing = FleetTiming {
        heartbeat_ms: 600_000,
        ..FleetTiming::fast()
    };
    (Arc::new(MemoryBroker::new()), timing)
}

#[tokio::test]
async fn press_publishes_and_drains_battery() {
    let (broker, timing) = setup_no_heartbeat();
    let button = Button::new(config(DeviceKind::Button, "Salon Button"), broker.clone(), timing);
    button.core().connect().await.unwrap();

    button.press(PressOptions::default()).await;
    button.press(PressOptions::default()).await;

    assert_eq!(button.press_count().await, 2);
    assert_eq!(button.core().battery().await, Percentage(98));

    let topic = device_topic("test", button.core().id(), "press");
    assert_eq!(broker.messages_on(&topic).await.len(), 2);
    assert_eq!(button.core().recorder().events_of(EventKind::Press).len(), 2);

    button.core().shutdown().await;
}

#[tokio::test]
async fn offline_device_publishes_nothing() {
    let (broker, timing) = setup();
    let button = Button::new(config(DeviceKind::Button, "Salon Button"), broker.clone(), timing);
    button.core().connect().await.unwrap();
    button.core().simulate_offline(None).await;

    button.press(PressOptions::default()).await;

    // The press is still registered locally; nothing reaches the broker.
    assert_eq!(button.press_count().await, 1);
    let topic = device_topic("test", button.core().id(), "press");
    assert!(broker.messages_on(&topic).await.is_empty());

    button.core().shutdown().await;
}

#[tokio::test]
async fn retriggered_offline_rearms_the_restore_timer() {
    let (_broker, timing) = setup();
    let button = Button::new(config(DeviceKind::Button, "Salon Button"), _broker.clone(), timing);
    button.core().connect().await.unwrap();

    button.core().simulate_offline(Some(Duration::from_millis(60))).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Going offline again while still offline replaces the restore deadline.
    button.core().simulate_offline(Some(Duration::from_millis(500))).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!button.core().is_connected().await);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(button.core().is_connected().await);

    button.core().shutdown().await;
}

#[tokio::test]
async fn open_ended_offline_cancels_a_pending_restore() {
    let (_broker, timing) = setup();
    let button = Button::new(config(DeviceKind::Button, "Salon Button"), _broker.clone(), timing);
    button.core().connect().await.unwrap();

    button.core().simulate_offline(Some(Duration::from_millis(60))).await;
    button.core().simulate_offline(None).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!button.core().is_connected().await);

    button.core().simulate_online().await;
    assert!(button.core().is_connected().await);

    button.core().shutdown().await;
}

#[tokio::test]
async fn unresponsive_button_records_failed_presses() {
    let (broker, timing) = setup();
    let button = Button::new(config(DeviceKind::Button, "Salon Button"), broker.clone(), timing);
    button.core().connect().await.unwrap();

    button.simulate_malfunction(MalfunctionMode::Unresponsive).await;
    button.press(PressOptions::default()).await;

    assert_eq!(button.press_count().await, 0);
    assert_eq!(
        button.core().recorder().events_of(EventKind::PressFailed).len(),
        1
    );

    // The malfunction self-restores after the unresponsive window.
    tokio::time::sleep(timing.unresponsive_window() * 3).await;
    assert_eq!(button.malfunction_mode().await, MalfunctionMode::Normal);

    button.core().shutdown().await;
}

#[tokio::test]
async fn emergency_press_carries_transcript() {
    let (broker, timing) = setup();
    let button = Button::new(config(DeviceKind::Button, "Salon Button"), broker.clone(), timing);
    button.core().connect().await.unwrap();

    button
        .emergency_press(Some("need assistance in the salon".to_owned()))
        .await;

    let press_topic = device_topic("test", button.core().id(), "press");
    let presses = broker.messages_on(&press_topic).await;
    assert_eq!(presses.len(), 1);
    assert_eq!(presses[0].payload["emergency"], true);
    assert_eq!(presses[0].payload["press_type"], "long");

    // Voice publication happens after the simulated processing delay.
    tokio::time::sleep(timing.voice_processing() * 3).await;
    let voice_topic = device_topic("test", button.core().id(), "voice");
    assert_eq!(broker.messages_on(&voice_topic).await.len(), 1);

    button.core().shutdown().await;
}

#[tokio::test]
async fn heartbeat_drains_battery_over_time() {
    let (broker, timing) = setup();
    let button = Button::new(config(DeviceKind::Button, "Salon Button"), broker.clone(), timing);
    button.core().connect().await.unwrap();

    tokio::time::sleep(timing.heartbeat() * 5).await;

    let topic = device_topic("test", button.core().id(), "heartbeat");
    assert!(!broker.messages_on(&topic).await.is_empty());
    assert!(button.core().battery().await < Percentage(100));

    button.core().shutdown().await;
}

#[tokio::test]
async fn offline_watch_ignores_service_requests() {
    let (broker, timing) = setup();
    let watch = Smartwatch::new(config(DeviceKind::Smartwatch, "Crew Watch"), broker.clone(), timing);
    watch.core().connect().await.unwrap();
    watch.assign_to_crew("steward-1").await;
    watch.set_crew_status(CrewStatus::Offline).await;

    watch
        .receive_service_request("req-1", serde_json::json!({ "room": "Salon" }))
        .await;

    assert!(watch.active_requests().await.is_empty());
    watch.core().shutdown().await;
}

#[tokio::test]
async fn completing_last_request_returns_to_available() {
    let (broker, timing) = setup();
    let watch = Smartwatch::new(config(DeviceKind::Smartwatch, "Crew Watch"), broker.clone(), timing);
    watch.core().connect().await.unwrap();
    watch.assign_to_crew("steward-1").await;
    watch.set_crew_status(CrewStatus::Busy).await;

    watch
        .receive_service_request("req-1", serde_json::json!({ "room": "Salon" }))
        .await;
    watch
        .receive_service_request("req-2", serde_json::json!({ "room": "Galley" }))
        .await;
    watch.accept_request("req-1").await;
    watch.accept_request("req-2").await;

    watch.complete_request("req-1").await;
    assert_eq!(watch.crew_status().await, CrewStatus::Busy);

    watch.complete_request("req-2").await;
    assert!(watch.active_requests().await.is_empty());
    assert_eq!(watch.crew_status().await, CrewStatus::Available);

    watch.core().shutdown().await;
}

#[tokio::test]
async fn sos_drains_battery_and_publishes() {
    let (broker, timing) = setup_no_heartbeat();
    let watch = Smartwatch::new(config(DeviceKind::Smartwatch, "Crew Watch"), broker.clone(), timing);
    watch.core().connect().await.unwrap();
    watch.assign_to_crew("captain").await;

    watch.send_sos(Some("man overboard")).await;

    assert_eq!(watch.core().battery().await, Percentage(98));
    let topic = device_topic("test", watch.core().id(), "sos");
    let messages = broker.messages_on(&topic).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload["crew_id"], "captain");
    // An SOS does not touch the duty status.
    assert_eq!(watch.crew_status().await, CrewStatus::Available);

    watch.core().shutdown().await;
}

#[tokio::test]
async fn fall_triggers_automatic_sos() {
    let (broker, timing) = setup();
    let watch = Smartwatch::new(config(DeviceKind::Smartwatch, "Crew Watch"), broker.clone(), timing);
    watch.core().connect().await.unwrap();

    watch.simulate_fall().await;

    let fall_topic = device_topic("test", watch.core().id(), "fall");
    assert_eq!(broker.messages_on(&fall_topic).await.len(), 1);

    tokio::time::sleep(timing.fall_sos() * 3).await;
    let sos_topic = device_topic("test", watch.core().id(), "sos");
    assert_eq!(broker.messages_on(&sos_topic).await.len(), 1);

    watch.core().shutdown().await;
}

#[tokio::test]
async fn relay_increments_hop_count() {
    let (broker, timing) = setup();
    let repeater = Repeater::new(config(DeviceKind::Repeater, "Mast Repeater"), broker.clone(), timing);
    repeater.core().connect().await.unwrap();

    let from = DeviceId::from("BTN-2026-AAAAAA");
    let to = DeviceId::from("SW-2026-BBBBBB");
    repeater.register_peer(from.clone()).await;
    repeater
        .relay_message(from, to, serde_json::json!({ "hop_count": 2, "body": "ping" }))
        .await;

    // Relay delay is randomized up to 150ms.
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(repeater.relayed_count().await, 1);
    let topic = repeater_topic("test", repeater.core().id(), "relay");
    let messages = broker.messages_on(&topic).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload["hop_count"], 3);

    repeater.core().shutdown().await;
}

#[tokio::test]
async fn packet_loss_drops_publishes_but_events_still_record() {
    let broker = Arc::new(MemoryBroker::new());
    // Long fault window so every press lands inside it.
    let timing = FleetTiming {
        heartbeat_ms: 600_000,
        network_fault_window_ms: 10_000,
        ..FleetTiming::fast()
    };
    let button = Button::new(config(DeviceKind::Button, "Salon Button"), broker.clone(), timing);
    button.core().connect().await.unwrap();

    button
        .core()
        .simulate_network_failure(NetworkFailure::PacketLoss)
        .await;
    for _ in 0..40 {
        button.press(PressOptions::default()).await;
    }

    // Every press reaches the local log; with a 0.5 drop ratio the odds of
    // all 40 publishes surviving (or all dropping) are negligible.
    assert_eq!(button.core().recorder().events_of(EventKind::Press).len(), 40);
    let topic = device_topic("test", button.core().id(), "press");
    let delivered = broker.messages_on(&topic).await.len();
    assert!(delivered > 0);
    assert!(delivered < 40);

    button.core().shutdown().await;
}

#[tokio::test]
async fn high_latency_publishes_eventually_arrive() {
    let (broker, timing) = setup();
    let button = Button::new(config(DeviceKind::Button, "Salon Button"), broker.clone(), timing);
    button.core().connect().await.unwrap();

    button
        .core()
        .simulate_network_failure(NetworkFailure::HighLatency)
        .await;
    for seq in 0..5 {
        button
            .core()
            .publish("telemetry", serde_json::json!({ "seq": seq }))
            .await;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let topic = device_topic("test", button.core().id(), "telemetry");
    assert_eq!(broker.messages_on(&topic).await.len(), 5);

    button.core().shutdown().await;
}

#[tokio::test]
async fn disconnect_fault_takes_the_device_offline_and_back() {
    let (broker, timing) = setup();
    let button = Button::new(config(DeviceKind::Button, "Salon Button"), broker.clone(), timing);
    button.core().connect().await.unwrap();

    button
        .core()
        .simulate_network_failure(NetworkFailure::Disconnect)
        .await;
    assert!(!button.core().is_connected().await);
    assert!(
        !button
            .core()
            .recorder()
            .events_of(EventKind::NetworkFailure)
            .is_empty()
    );

    // The fast fault window elapses well inside this sleep.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(button.core().is_connected().await);

    button.core().shutdown().await;
}

#[tokio::test]
async fn rapid_press_registers_every_press() {
    let (_broker, timing) = setup();
    let button = Button::new(config(DeviceKind::Button, "Salon Button"), _broker.clone(), timing);
    button.core().connect().await.unwrap();

    button.rapid_press(5, Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(button.press_count().await, 5);

    button.core().shutdown().await;
}

#[tokio::test]
async fn signal_strength_update_reclassifies_quality() {
    let (broker, timing) = setup();
    let repeater = Repeater::new(config(DeviceKind::Repeater, "Mast Repeater"), broker.clone(), timing);
    repeater.core().connect().await.unwrap();

    // -55 dBm baseline drops to -75, crossing into the poor band.
    repeater.update_signal_strength(-20).await;
    assert_eq!(repeater.signal_dbm().await, Dbm::new(-75));
    assert_eq!(repeater.signal_quality().await, SignalQuality::Poor);

    let topic = repeater_topic("test", repeater.core().id(), "signal");
    let messages = broker.messages_on(&topic).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload["quality"], "poor");

    repeater.core().shutdown().await;
}

#[tokio::test]
async fn interference_drops_and_restores_mesh_signal() {
    let (broker, timing) = setup();
    let repeater = Repeater::new(config(DeviceKind::Repeater, "Mast Repeater"), broker.clone(), timing);
    repeater.core().connect().await.unwrap();

    let before = repeater.signal_dbm().await;
    repeater
        .simulate_interference(Duration::from_millis(80), bosun_core::FailureSeverity::Critical)
        .await;
    assert!(repeater.signal_dbm().await < before);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(repeater.signal_dbm().await, before);

    repeater.core().shutdown().await;
}

#[tokio::test]
async fn stale_peers_are_evicted() {
    let (broker, timing) = setup();
    let repeater = Repeater::new(config(DeviceKind::Repeater, "Mast Repeater"), broker.clone(), timing);
    repeater.core().connect().await.unwrap();

    repeater.register_peer(DeviceId::from("BTN-2026-AAAAAA")).await;
    assert_eq!(repeater.peers().await.len(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let evicted = repeater.cleanup_stale_peers(Duration::from_millis(10)).await;
    assert_eq!(evicted, 1);
    assert!(repeater.peers().await.is_empty());

    repeater.core().shutdown().await;
}

#[tokio::test]
async fn firmware_update_swaps_version_and_resets_uptime() {
    let (broker, timing) = setup();
    let repeater = Repeater::new(config(DeviceKind::Repeater, "Mast Repeater"), broker.clone(), timing);
    repeater.core().connect().await.unwrap();

    repeater
        .simulate_firmware_update("2.1.0", Duration::from_millis(50))
        .await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(repeater.firmware_version().await.as_ref(), "2.1.0");
    assert!(repeater.uptime().await < Duration::from_millis(400));
    let phases = repeater.core().recorder().events_of(EventKind::FirmwareUpdate);
    assert!(phases.iter().any(|e| e.payload["phase"] == "completed"));

    repeater.core().shutdown().await;
}

#[tokio::test]
async fn movement_pattern_publishes_location_updates() {
    let (broker, timing) = setup();
    let watch = Smartwatch::new(config(DeviceKind::Smartwatch, "Crew Watch"), broker.clone(), timing);
    watch.core().connect().await.unwrap();

    watch
        .simulate_movement(MovementPattern::RandomWalk, Duration::from_millis(100))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let topic = device_topic("test", watch.core().id(), "location");
    assert!(!broker.messages_on(&topic).await.is_empty());
    assert!(
        !watch
            .core()
            .recorder()
            .events_of(EventKind::Location)
            .is_empty()
    );

    watch.core().shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_background_tasks() {
    let (broker, timing) = setup();
    let button = Button::new(config(DeviceKind::Button, "Salon Button"), broker.clone(), timing);
    button.core().connect().await.unwrap();
    button.core().shutdown().await;

    let before = broker.messages().await.len();
    tokio::time::sleep(timing.heartbeat() * 5).await;
    assert_eq!(broker.messages().await.len(), before);
    assert!(!button.core().is_connected().await);
}
