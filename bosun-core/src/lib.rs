use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

// We use `Box<str>` for strings that never change after creation. This keeps
// allocations compact and avoids accidental growth of long-lived values.
type BoxStr = Box<str>;

mod geo;
pub use geo::{GeoPoint, bearing_degrees, haversine_meters};

/// Alphabet used for device id suffixes: Crockford base32, no ambiguous
/// characters, so ids stay human-legible in logs and on labels.
const ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ID_SUFFIX_LEN: usize = 6;

/// Unique identifier for a simulated device.
///
/// Ids are human-legible and encode kind and provisioning year, e.g.
/// `BTN-2026-4KQ7X2`. Random suffixes make collisions implausible at fleet
/// scale without needing central coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub BoxStr);

impl DeviceId {
    /// Generate a fresh id for a device of the given kind.
    pub fn generate(kind: DeviceKind) -> Self {
        let year = jiff::Timestamp::now()
            .to_zoned(jiff::tz::TimeZone::UTC)
            .year();
        let mut rng = rand::rng();
        let suffix: String = (0..ID_SUFFIX_LEN)
            .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
            .collect();
        Self(format!("{}-{year}-{suffix}", kind.prefix()).into_boxed_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

/// Unique identifier for a recorded device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Ulid);

/// Device classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Wall-mounted emergency call button.
    Button,
    /// Crew-worn smartwatch.
    Smartwatch,
    /// Radio mesh repeater.
    Repeater,
}

impl DeviceKind {
    pub fn prefix(self) -> &'static str {
        match self {
            DeviceKind::Button => "BTN",
            DeviceKind::Smartwatch => "SW",
            DeviceKind::Repeater => "RPT",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Button => "button",
            DeviceKind::Smartwatch => "smartwatch",
            DeviceKind::Repeater => "repeater",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Percentage value in the range 0–100 (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Percentage(pub u8);

impl Percentage {
    pub fn new(value: u8) -> Self {
        Self(value.min(100))
    }

    /// Subtract, saturating at zero.
    pub fn drain(self, amount: u8) -> Self {
        Self(self.0.saturating_sub(amount))
    }

    /// Apply a signed delta, clamped into 0–100.
    pub fn adjust(self, delta: i16) -> Self {
        Self((self.0 as i16 + delta).clamp(0, 100) as u8)
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Received signal strength in dBm, clamped into the realistic repeater band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dbm(pub i16);

impl Dbm {
    pub const MIN: i16 = -100;
    pub const MAX: i16 = -30;

    pub fn new(value: i16) -> Self {
        Self(value.clamp(Self::MIN, Self::MAX))
    }

    pub fn adjust(self, delta: i16) -> Self {
        Self::new(self.0.saturating_add(delta))
    }
}

/// Signal-quality classification banded from dBm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    VeryPoor,
}

impl SignalQuality {
    pub fn from_dbm(dbm: Dbm) -> Self {
        match dbm.0 {
            v if v >= -50 => SignalQuality::Excellent,
            v if v >= -60 => SignalQuality::Good,
            v if v >= -70 => SignalQuality::Fair,
            v if v >= -85 => SignalQuality::Poor,
            _ => SignalQuality::VeryPoor,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalQuality::Excellent => "excellent",
            SignalQuality::Good => "good",
            SignalQuality::Fair => "fair",
            SignalQuality::Poor => "poor",
            SignalQuality::VeryPoor => "very_poor",
        }
    }
}

/// Crew member availability as tracked by a smartwatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrewStatus {
    Available,
    Busy,
    Break,
    Offline,
}

impl CrewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CrewStatus::Available => "available",
            CrewStatus::Busy => "busy",
            CrewStatus::Break => "break",
            CrewStatus::Offline => "offline",
        }
    }
}

/// Taxonomy of events a device can record. The kind plus a free-form JSON
/// payload is the stable contract; delivery mechanics are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Disconnected,
    Heartbeat,
    Status,
    LowBattery,
    PoorSignal,
    NetworkFailure,
    Press,
    PressFailed,
    VoiceMessage,
    Location,
    Notification,
    RequestReceived,
    RequestAccepted,
    RequestDeclined,
    RequestCompleted,
    Sos,
    Fall,
    Relay,
    PeerConnected,
    PeerDisconnected,
    Signal,
    Interference,
    Congestion,
    FirmwareUpdate,
    FirmwareCrash,
    FirmwareRecovery,
    MemoryUsage,
    DeviceCreated,
    DeviceRemoved,
    FailureStarted,
    FailureStopped,
}

/// An immutable record of something a device did or had done to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// Unique id for this event.
    pub id: EventId,
    /// Device the event belongs to.
    pub device_id: DeviceId,
    /// Event classification.
    pub kind: EventKind,
    /// Free-form payload; shape depends on the kind.
    pub payload: serde_json::Value,
    /// When the event was recorded.
    pub timestamp: jiff::Timestamp,
}

impl DeviceEvent {
    pub fn new(device_id: DeviceId, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: EventId(Ulid::new()),
            device_id,
            kind,
            payload,
            timestamp: jiff::Timestamp::now(),
        }
    }
}

/// Catalogue of injectable failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BatteryDrain,
    SignalLoss,
    DeviceOffline,
    IntermittentConnection,
    ButtonMalfunction,
    NetworkCongestion,
    FirmwareCrash,
    MemoryLeak,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::BatteryDrain => "battery_drain",
            FailureKind::SignalLoss => "signal_loss",
            FailureKind::DeviceOffline => "device_offline",
            FailureKind::IntermittentConnection => "intermittent_connection",
            FailureKind::ButtonMalfunction => "button_malfunction",
            FailureKind::NetworkCongestion => "network_congestion",
            FailureKind::FirmwareCrash => "firmware_crash",
            FailureKind::MemoryLeak => "memory_leak",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How strongly a failure effect is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FailureSeverity {
    /// Multiplier applied to effect magnitudes.
    pub fn factor(self) -> f64 {
        match self {
            FailureSeverity::Low => 0.25,
            FailureSeverity::Medium => 0.5,
            FailureSeverity::High => 0.75,
            FailureSeverity::Critical => 1.0,
        }
    }

    /// Floor a signal-loss effect pushes signal strength toward.
    pub fn signal_floor(self) -> Percentage {
        match self {
            FailureSeverity::Low => Percentage(40),
            FailureSeverity::Medium => Percentage(25),
            FailureSeverity::High => Percentage(10),
            FailureSeverity::Critical => Percentage(0),
        }
    }
}

/// Which devices a failure scenario applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailureTarget {
    /// Explicit device selection.
    Devices(Vec<DeviceId>),
    /// Every registered device.
    All(AllDevices),
}

/// Marker for the `"all"` target selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllDevices {
    All,
}

impl FailureTarget {
    pub fn all() -> Self {
        FailureTarget::All(AllDevices::All)
    }
}

/// A named, parameterized failure template. Scenarios are stateless data;
/// executing one produces active failure handles keyed by (device, kind).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureScenario {
    pub name: BoxStr,
    pub kind: FailureKind,
    pub target: FailureTarget,
    pub severity: FailureSeverity,
    /// Effect duration in milliseconds; `None` means until explicitly stopped.
    pub duration_ms: Option<u64>,
    /// Kind-specific parameters (drain rate, target level, leak rate, ...).
    #[serde(default)]
    pub params: serde_json::Value,
}

impl FailureScenario {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }

    /// Read a numeric parameter, falling back to a default.
    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.params.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
    }

    /// Read a string parameter, falling back to a default.
    pub fn param_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.params.get(key).and_then(|v| v.as_str()).unwrap_or(default)
    }

    /// Read a boolean parameter, falling back to a default.
    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }
}

/// Row shape written to the external device store on creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: BoxStr,
    pub kind: DeviceKind,
    pub location: BoxStr,
    pub battery: Percentage,
    pub signal: Percentage,
    /// Always true for fleet-managed devices; distinguishes simulated rows
    /// from physical hardware in the shared table.
    pub virtual_device: bool,
    pub created_at: jiff::Timestamp,
}

/// Topic for a per-device channel: `<ns>/device/<id>/<channel>`.
pub fn device_topic(namespace: &str, id: &DeviceId, channel: &str) -> String {
    format!("{namespace}/device/{id}/{channel}")
}

/// Topic for a repeater-specific channel: `<ns>/repeater/<id>/<channel>`.
pub fn repeater_topic(namespace: &str, id: &DeviceId, channel: &str) -> String {
    format!("{namespace}/repeater/{id}/{channel}")
}
