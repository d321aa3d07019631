//! Predefined failure scenarios: ready-made templates with sensible default
//! parameters. These are data, not code; `FailureSimulator::execute` gives
//! them effect.

use bosun_core::{FailureKind, FailureScenario, FailureSeverity, FailureTarget};
use serde_json::json;

pub const LOW_BATTERY_WARNING: &str = "low_battery_warning";
pub const POOR_SIGNAL_AREA: &str = "poor_signal_area";
pub const NETWORK_OUTAGE: &str = "network_outage";
pub const UNSTABLE_CONNECTION: &str = "unstable_connection";
pub const STUCK_BUTTON: &str = "stuck_button";
pub const REPEATER_CONGESTION: &str = "repeater_congestion";
pub const FIRMWARE_CRASH: &str = "firmware_crash";
pub const CRITICAL_MEMORY_LEAK: &str = "critical_memory_leak";

/// Every shipped scenario template, targeting all devices by default.
pub fn predefined() -> Vec<FailureScenario> {
    vec![
        FailureScenario {
            name: LOW_BATTERY_WARNING.into(),
            kind: FailureKind::BatteryDrain,
            target: FailureTarget::all(),
            severity: FailureSeverity::Medium,
            duration_ms: None,
            params: json!({ "target_level": 15, "drain_rate": 5 }),
        },
        FailureScenario {
            name: POOR_SIGNAL_AREA.into(),
            kind: FailureKind::SignalLoss,
            target: FailureTarget::all(),
            severity: FailureSeverity::High,
            duration_ms: Some(30_000),
            params: json!({}),
        },
        FailureScenario {
            name: NETWORK_OUTAGE.into(),
            kind: FailureKind::DeviceOffline,
            target: FailureTarget::all(),
            severity: FailureSeverity::Critical,
            duration_ms: Some(10_000),
            params: json!({}),
        },
        FailureScenario {
            name: UNSTABLE_CONNECTION.into(),
            kind: FailureKind::IntermittentConnection,
            target: FailureTarget::all(),
            severity: FailureSeverity::Medium,
            duration_ms: Some(30_000),
            params: json!({ "interval_ms": 3000, "offline_ms": 1000 }),
        },
        FailureScenario {
            name: STUCK_BUTTON.into(),
            kind: FailureKind::ButtonMalfunction,
            target: FailureTarget::all(),
            severity: FailureSeverity::High,
            duration_ms: Some(15_000),
            params: json!({ "mode": "stuck" }),
        },
        FailureScenario {
            name: REPEATER_CONGESTION.into(),
            kind: FailureKind::NetworkCongestion,
            target: FailureTarget::all(),
            severity: FailureSeverity::High,
            duration_ms: Some(10_000),
            params: json!({ "message_count": 50 }),
        },
        FailureScenario {
            name: FIRMWARE_CRASH.into(),
            kind: FailureKind::FirmwareCrash,
            target: FailureTarget::all(),
            severity: FailureSeverity::Critical,
            duration_ms: None,
            params: json!({}),
        },
        FailureScenario {
            name: CRITICAL_MEMORY_LEAK.into(),
            kind: FailureKind::MemoryLeak,
            target: FailureTarget::all(),
            severity: FailureSeverity::Critical,
            duration_ms: None,
            params: json!({ "leak_rate": 10 }),
        },
    ]
}

/// Look up a predefined scenario by name.
pub fn by_name(name: &str) -> Option<FailureScenario> {
    predefined().into_iter().find(|s| s.name.as_ref() == name)
}
