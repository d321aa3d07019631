pub mod broker;
pub mod config;
pub mod device;
pub mod failure;
pub mod fleet;
pub mod recorder;
pub mod store;

pub use broker::memory::MemoryBroker;
pub use broker::{Broker, BrokerError, BrokerMessage};
pub use config::{Config, FleetConfig, FleetTiming, ServerConfig, StoreConfig, Topology};
pub use device::button::{Button, MalfunctionMode, PressOptions};
pub use device::repeater::Repeater;
pub use device::watch::{MovementPattern, Smartwatch};
pub use device::{Device, DeviceConfig, DeviceStatusSnapshot, NetworkFailure};
pub use failure::scenarios;
pub use failure::{ActiveFailureInfo, FailureError, FailureSimulator};
pub use fleet::{CreateDevice, FleetError, FleetManager, FleetStatistics};
pub use recorder::EventRecorder;
pub use store::memory::MemoryStore;
pub use store::sqlite::SqliteStore;
pub use store::{DeviceStore, StoreError};
