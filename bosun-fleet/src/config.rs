use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub fleet: FleetConfig,
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub timing: FleetTiming,
    /// Topology to deploy at startup, if any.
    #[serde(default)]
    pub topology: Option<Topology>,
}

#[derive(Debug, Deserialize)]
pub struct FleetConfig {
    /// Topic namespace all devices publish under.
    pub namespace: String,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the HTTP server to listen on.
    pub http_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// No persistence; devices exist only in the registry.
    None,
    Memory,
    Sqlite { path: PathBuf },
}

/// Canned multi-device topologies, used as reproducible fixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    BasicSetup,
    FullYacht,
    StressTest,
}

/// Every delay and interval the simulation uses, in milliseconds.
///
/// Defaults are the reference values; tests swap in `FleetTiming::fast()` so
/// the same code paths run in tens of milliseconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FleetTiming {
    /// Heartbeat interval (reference 30s).
    pub heartbeat_ms: u64,
    /// Delay before a recorded transcript is published as a voice message.
    pub voice_processing_ms: u64,
    /// Window an unresponsive button stays broken before self-restoring.
    pub unresponsive_window_ms: u64,
    /// Delay before an available crew member auto-accepts a request.
    pub auto_accept_ms: u64,
    /// Delay between a detected fall and the automatic SOS.
    pub fall_sos_ms: u64,
    /// Cadence of simulated movement location updates.
    pub movement_step_ms: u64,
    /// How long packet-loss / high-latency network faults last.
    pub network_fault_window_ms: u64,
    /// Simulated reboot duration after a firmware crash or update.
    pub reboot_ms: u64,
    /// Tick interval for periodic failure injectors.
    pub failure_tick_ms: u64,
}

impl Default for FleetTiming {
    fn default() -> Self {
        Self {
            heartbeat_ms: 30_000,
            voice_processing_ms: 2_000,
            unresponsive_window_ms: 30_000,
            auto_accept_ms: 5_000,
            fall_sos_ms: 3_000,
            movement_step_ms: 5_000,
            network_fault_window_ms: 10_000,
            reboot_ms: 5_000,
            failure_tick_ms: 1_000,
        }
    }
}

impl FleetTiming {
    /// Millisecond-scale timings for tests.
    pub fn fast() -> Self {
        Self {
            heartbeat_ms: 20,
            voice_processing_ms: 20,
            unresponsive_window_ms: 80,
            auto_accept_ms: 40,
            fall_sos_ms: 30,
            movement_step_ms: 15,
            network_fault_window_ms: 80,
            reboot_ms: 40,
            failure_tick_ms: 15,
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn voice_processing(&self) -> Duration {
        Duration::from_millis(self.voice_processing_ms)
    }

    pub fn unresponsive_window(&self) -> Duration {
        Duration::from_millis(self.unresponsive_window_ms)
    }

    pub fn auto_accept(&self) -> Duration {
        Duration::from_millis(self.auto_accept_ms)
    }

    pub fn fall_sos(&self) -> Duration {
        Duration::from_millis(self.fall_sos_ms)
    }

    pub fn movement_step(&self) -> Duration {
        Duration::from_millis(self.movement_step_ms)
    }

    pub fn network_fault_window(&self) -> Duration {
        Duration::from_millis(self.network_fault_window_ms)
    }

    pub fn reboot(&self) -> Duration {
        Duration::from_millis(self.reboot_ms)
    }

    pub fn failure_tick(&self) -> Duration {
        Duration::from_millis(self.failure_tick_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fleet: FleetConfig {
                namespace: "bosun".to_string(),
            },
            server: ServerConfig {
                http_addr: "0.0.0.0:8090".parse().unwrap(),
            },
            store: StoreConfig::Memory,
            timing: FleetTiming::default(),
            topology: Some(Topology::BasicSetup),
        }
    }
}
