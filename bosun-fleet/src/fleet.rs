//! Fleet manager: device lifecycle, canned topologies, scenario execution
//! and fleet-wide statistics.

use std::collections::HashMap;
use std::sync::Arc;

use bosun_core::{
    DeviceEvent, DeviceId, DeviceKind, DeviceRecord, EventKind, FailureScenario, Percentage,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerError};
use crate::config::{FleetTiming, Topology};
use crate::device::button::Button;
use crate::device::repeater::Repeater;
use crate::device::watch::Smartwatch;
use crate::device::{Device, DeviceConfig};
use crate::failure::{ActiveFailureInfo, FailureError, FailureSimulator};
use crate::recorder::EventRecorder;
use crate::store::DeviceStore;

/// Default battery level for a freshly provisioned device.
const DEFAULT_BATTERY: u8 = 100;
/// Default signal level for a freshly provisioned device.
const DEFAULT_SIGNAL: u8 = 85;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Failure(#[from] FailureError),
    #[error("device not found: {0}")]
    DeviceNotFound(DeviceId),
}

/// Request to provision one device.
#[derive(Debug, Clone)]
pub struct CreateDevice {
    pub kind: DeviceKind,
    pub name: Box<str>,
    pub location: Box<str>,
    pub battery: Percentage,
    pub signal: Percentage,
}

impl CreateDevice {
    pub fn new(kind: DeviceKind, name: &str, location: &str) -> Self {
        Self {
            kind,
            name: name.into(),
            location: location.into(),
            battery: Percentage::new(DEFAULT_BATTERY),
            signal: Percentage::new(DEFAULT_SIGNAL),
        }
    }
}

/// Point-in-time summary of the fleet.
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatistics {
    pub total_devices: usize,
    pub buttons: usize,
    pub smartwatches: usize,
    pub repeaters: usize,
    pub online: usize,
    pub offline: usize,
    pub active_failures: usize,
    pub events_recorded: usize,
    pub average_battery: f64,
    pub average_signal: f64,
}

/// Owns every simulated device and coordinates the failure simulator, the
/// broker connection and the optional external store.
pub struct FleetManager {
    devices: Arc<Mutex<HashMap<DeviceId, Device>>>,
    broker: Arc<dyn Broker>,
    store: Option<Arc<dyn DeviceStore>>,
    simulator: FailureSimulator,
    recorder: EventRecorder,
    namespace: Box<str>,
    timing: FleetTiming,
}

impl Clone for FleetManager {
    fn clone(&self) -> Self {
        Self {
            devices: Arc::clone(&self.devices),
            broker: Arc::clone(&self.broker),
            store: self.store.clone(),
            simulator: self.simulator.clone(),
            recorder: self.recorder.clone(),
            namespace: self.namespace.clone(),
            timing: self.timing,
        }
    }
}

impl FleetManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Option<Arc<dyn DeviceStore>>,
        namespace: &str,
        timing: FleetTiming,
    ) -> Self {
        Self {
            devices: Arc::new(Mutex::new(HashMap::new())),
            broker,
            store,
            simulator: FailureSimulator::new(timing),
            recorder: EventRecorder::new(DeviceId::from("FLEET")),
            namespace: namespace.into(),
            timing,
        }
    }

    /// Fleet-level event log (creations, removals, scenario runs).
    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    pub fn simulator(&self) -> &FailureSimulator {
        &self.simulator
    }

    /// Provision a device, connect it to the broker and register it with the
    /// failure simulator. The external store write is best-effort; a store
    /// outage must not block the simulation.
    pub async fn create_device(&self, request: CreateDevice) -> Result<Device, FleetError> {
        let id = DeviceId::generate(request.kind);
        let config = DeviceConfig {
            id: id.clone(),
            name: request.name.clone(),
            kind: request.kind,
            location: request.location.clone(),
            namespace: self.namespace.clone(),
            battery: request.battery,
            signal: request.signal,
        };

        let device = match request.kind {
            DeviceKind::Button => {
                Device::Button(Button::new(config, Arc::clone(&self.broker), self.timing))
            }
            DeviceKind::Smartwatch => {
                Device::Smartwatch(Smartwatch::new(config, Arc::clone(&self.broker), self.timing))
            }
            DeviceKind::Repeater => {
                Device::Repeater(Repeater::new(config, Arc::clone(&self.broker), self.timing))
            }
        };

        device.connect().await?;

        self.devices.lock().await.insert(id.clone(), device.clone());
        self.simulator.register(device.clone()).await;

        if let Some(store) = &self.store {
            let record = DeviceRecord {
                id: id.clone(),
                name: request.name,
                kind: request.kind,
                location: request.location,
                battery: request.battery,
                signal: request.signal,
                virtual_device: true,
                created_at: jiff::Timestamp::now(),
            };
            if let Err(err) = store.insert(record).await {
                warn!(device_id = %id, error = %err, "device store insert failed");
            }
        }

        self.recorder.record(
            EventKind::DeviceCreated,
            json!({ "device_id": id, "kind": request.kind }),
        );
        info!(device_id = %id, kind = %request.kind, "device created");
        Ok(device)
    }

    /// Tear a device down: stop its failures and timers, disconnect it and
    /// delete its store row.
    pub async fn remove_device(&self, id: &DeviceId) -> Result<(), FleetError> {
        let device = self
            .devices
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| FleetError::DeviceNotFound(id.clone()))?;

        self.simulator.unregister(id).await;
        device.shutdown().await;

        if let Some(store) = &self.store {
            if let Err(err) = store.delete(id).await {
                warn!(device_id = %id, error = %err, "device store delete failed");
            }
        }

        self.recorder
            .record(EventKind::DeviceRemoved, json!({ "device_id": id }));
        info!(device_id = %id, "device removed");
        Ok(())
    }

    /// Remove every device in the fleet.
    pub async fn remove_all(&self) -> Result<(), FleetError> {
        let ids: Vec<DeviceId> = self.devices.lock().await.keys().cloned().collect();
        for id in ids {
            self.remove_device(&id).await?;
        }
        Ok(())
    }

    pub async fn device(&self, id: &DeviceId) -> Option<Device> {
        self.devices.lock().await.get(id).cloned()
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.devices.lock().await.values().cloned().collect()
    }

    pub async fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.lock().await.keys().cloned().collect()
    }

    pub async fn devices_of_kind(&self, kind: DeviceKind) -> Vec<Device> {
        self.devices
            .lock()
            .await
            .values()
            .filter(|d| d.kind() == kind)
            .cloned()
            .collect()
    }

    pub async fn devices_at(&self, location: &str) -> Vec<Device> {
        self.devices
            .lock()
            .await
            .values()
            .filter(|d| d.core().config().location.as_ref() == location)
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.devices.lock().await.len()
    }

    /// Run a failure scenario against the fleet.
    pub async fn execute_failure_scenario(
        &self,
        scenario: &FailureScenario,
    ) -> Result<Vec<ActiveFailureInfo>, FleetError> {
        let installed = self.simulator.execute(scenario).await?;
        self.recorder.record(
            EventKind::FailureStarted,
            json!({ "scenario": scenario.name, "devices": installed.len() }),
        );
        Ok(installed)
    }

    pub async fn active_failures(&self) -> Vec<ActiveFailureInfo> {
        self.simulator.active_failures().await
    }

    pub async fn stop_device_failures(&self, id: &DeviceId) -> usize {
        let stopped = self.simulator.stop_device(id).await;
        if stopped > 0 {
            self.recorder.record(
                EventKind::FailureStopped,
                json!({ "device_id": id, "stopped": stopped }),
            );
        }
        stopped
    }

    pub async fn stop_all_failures(&self) -> usize {
        let stopped = self.simulator.stop_all().await;
        if stopped > 0 {
            self.recorder
                .record(EventKind::FailureStopped, json!({ "stopped": stopped }));
        }
        stopped
    }

    /// Provision one of the canned topologies and return the new devices.
    pub async fn deploy(&self, topology: Topology) -> Result<Vec<Device>, FleetError> {
        let mut created = Vec::new();
        match topology {
            Topology::BasicSetup => {
                for (name, location) in [("Salon Call Button", "Salon"), ("Cabin Call Button", "Master Cabin")]
                {
                    created.push(
                        self.create_device(CreateDevice::new(DeviceKind::Button, name, location))
                            .await?,
                    );
                }
                let watch = self
                    .create_device(CreateDevice::new(
                        DeviceKind::Smartwatch,
                        "Steward Watch",
                        "Crew Quarters",
                    ))
                    .await?;
                if let Some(w) = watch.as_smartwatch() {
                    w.assign_to_crew("steward-1").await;
                }
                created.push(watch);
                created.push(
                    self.create_device(CreateDevice::new(
                        DeviceKind::Repeater,
                        "Mast Repeater",
                        "Main Mast",
                    ))
                    .await?,
                );
            }
            Topology::FullYacht => {
                let buttons = [
                    ("Salon Call Button", "Salon"),
                    ("Master Cabin Button", "Master Cabin"),
                    ("Guest Cabin Button", "Guest Cabin"),
                    ("Galley Call Button", "Galley"),
                    ("Bridge Call Button", "Bridge"),
                    ("Aft Deck Button", "Aft Deck"),
                ];
                for (name, location) in buttons {
                    created.push(
                        self.create_device(CreateDevice::new(DeviceKind::Button, name, location))
                            .await?,
                    );
                }
                let crew = ["captain", "first-mate", "chef", "steward-1"];
                for (i, crew_id) in crew.iter().enumerate() {
                    let watch = self
                        .create_device(CreateDevice::new(
                            DeviceKind::Smartwatch,
                            &format!("Crew Watch {}", i + 1),
                            "Crew Quarters",
                        ))
                        .await?;
                    if let Some(w) = watch.as_smartwatch() {
                        w.assign_to_crew(crew_id).await;
                    }
                    created.push(watch);
                }
                let repeaters = [
                    ("Mast Repeater", "Main Mast"),
                    ("Bridge Repeater", "Bridge"),
                    ("Engine Room Repeater", "Engine Room"),
                ];
                for (name, location) in repeaters {
                    created.push(
                        self.create_device(CreateDevice::new(DeviceKind::Repeater, name, location))
                            .await?,
                    );
                }
            }
            Topology::StressTest => {
                for i in 1..=10 {
                    created.push(
                        self.create_device(CreateDevice::new(
                            DeviceKind::Button,
                            &format!("Stress Button {i}"),
                            &format!("Zone {i}"),
                        ))
                        .await?,
                    );
                }
                for i in 1..=6 {
                    let watch = self
                        .create_device(CreateDevice::new(
                            DeviceKind::Smartwatch,
                            &format!("Stress Watch {i}"),
                            "Crew Quarters",
                        ))
                        .await?;
                    if let Some(w) = watch.as_smartwatch() {
                        w.assign_to_crew(&format!("crew-{i}")).await;
                    }
                    created.push(watch);
                }
                for i in 1..=4 {
                    created.push(
                        self.create_device(CreateDevice::new(
                            DeviceKind::Repeater,
                            &format!("Stress Repeater {i}"),
                            &format!("Deck {i}"),
                        ))
                        .await?,
                    );
                }
            }
        }
        info!(topology = ?topology, devices = created.len(), "topology deployed");
        Ok(created)
    }

    /// Snapshot fleet-wide counters.
    pub async fn statistics(&self) -> FleetStatistics {
        let devices = self.devices().await;
        let mut buttons = 0;
        let mut smartwatches = 0;
        let mut repeaters = 0;
        let mut online = 0;
        let mut events = self.recorder.len();
        let mut battery_sum = 0u64;
        let mut signal_sum = 0u64;

        for device in &devices {
            match device.kind() {
                DeviceKind::Button => buttons += 1,
                DeviceKind::Smartwatch => smartwatches += 1,
                DeviceKind::Repeater => repeaters += 1,
            }
            if device.core().is_connected().await {
                online += 1;
            }
            events += device.recorder().len();
            battery_sum += u64::from(device.core().battery().await.0);
            signal_sum += u64::from(device.core().signal().await.0);
        }

        let total = devices.len();
        FleetStatistics {
            total_devices: total,
            buttons,
            smartwatches,
            repeaters,
            online,
            offline: total - online,
            active_failures: self.simulator.active_failures().await.len(),
            events_recorded: events,
            average_battery: if total == 0 {
                0.0
            } else {
                battery_sum as f64 / total as f64
            },
            average_signal: if total == 0 {
                0.0
            } else {
                signal_sum as f64 / total as f64
            },
        }
    }

    /// Flatten every device's event log, keyed by device id. The fleet's own
    /// lifecycle log is included under its recorder id.
    pub async fn export_events(&self) -> HashMap<DeviceId, Vec<DeviceEvent>> {
        let mut export = HashMap::new();
        export.insert(self.recorder.device_id().clone(), self.recorder.events());
        for device in self.devices().await {
            export.insert(device.id().clone(), device.recorder().events());
        }
        export
    }
}
