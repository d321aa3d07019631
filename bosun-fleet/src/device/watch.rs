use std::sync::Arc;
use std::time::Duration;

use bosun_core::{CrewStatus, EventKind, GeoPoint, bearing_degrees, haversine_meters};
use rand::Rng;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::FleetTiming;

use super::{DeviceConfig, DeviceCore};

/// Battery drained by sending an SOS.
const SOS_DRAIN: u8 = 2;
/// Nominal wall-clock delta assumed between location fixes when deriving
/// speed; fixes are not timestamp-paired in the simulation.
const NOMINAL_FIX_DELTA_SECS: f64 = 5.0;
/// Default anchorage position (Gulf of Saint-Tropez).
const DEFAULT_POSITION: GeoPoint = GeoPoint {
    lat: 43.2705,
    lng: 6.6400,
};
/// Patrol square edge, in degrees (~20 m).
const PATROL_STEP_DEG: f64 = 0.00018;
/// Random-walk step bound, in degrees.
const WALK_STEP_DEG: f64 = 0.0002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementPattern {
    /// Square path around the starting position.
    Patrol,
    RandomWalk,
    Stationary,
}

struct WatchState {
    crew_id: Option<Box<str>>,
    crew_status: CrewStatus,
    location: GeoPoint,
    active_requests: Vec<Box<str>>,
    movement: Option<CancellationToken>,
}

/// Crew-worn smartwatch: request lifecycle, location tracking, SOS.
pub struct Smartwatch {
    core: Arc<DeviceCore>,
    state: Mutex<WatchState>,
}

impl Smartwatch {
    pub fn new(config: DeviceConfig, broker: Arc<dyn Broker>, timing: FleetTiming) -> Arc<Self> {
        Arc::new(Self {
            core: DeviceCore::new(config, broker, timing),
            state: Mutex::new(WatchState {
                crew_id: None,
                crew_status: CrewStatus::Available,
                location: DEFAULT_POSITION,
                active_requests: Vec::new(),
                movement: None,
            }),
        })
    }

    pub fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }

    pub async fn crew_status(&self) -> CrewStatus {
        self.state.lock().await.crew_status
    }

    pub async fn crew_id(&self) -> Option<Box<str>> {
        self.state.lock().await.crew_id.clone()
    }

    pub async fn location(&self) -> GeoPoint {
        self.state.lock().await.location
    }

    pub async fn active_requests(&self) -> Vec<Box<str>> {
        self.state.lock().await.active_requests.clone()
    }

    /// Rebind the watch to a crew member.
    pub async fn assign_to_crew(&self, crew_id: &str) {
        {
            let mut state = self.state.lock().await;
            state.crew_id = Some(crew_id.into());
        }
        self.core.recorder().record(
            EventKind::Notification,
            json!({ "assigned_crew": crew_id }),
        );
        info!(device_id = %self.core.id(), crew_id, "Watch assigned to crew");
    }

    /// Set `break`/`offline` (or any status) directly; the available/busy
    /// pair is normally driven by the request lifecycle.
    pub async fn set_crew_status(&self, status: CrewStatus) {
        let mut state = self.state.lock().await;
        state.crew_status = status;
    }

    /// Record a new position and publish derived speed and heading.
    pub async fn update_location(self: &Arc<Self>, location: GeoPoint) {
        let previous = {
            let mut state = self.state.lock().await;
            let prev = state.location;
            state.location = location;
            prev
        };

        let distance = haversine_meters(previous, location);
        let speed_mps = distance / NOMINAL_FIX_DELTA_SECS;
        let heading = bearing_degrees(previous, location);

        self.core
            .publish(
                "location",
                json!({
                    "lat": location.lat,
                    "lng": location.lng,
                    "speed_mps": speed_mps,
                    "heading_deg": heading,
                }),
            )
            .await;
        self.core.recorder().record(
            EventKind::Location,
            json!({ "lat": location.lat, "lng": location.lng, "speed_mps": speed_mps }),
        );
    }

    /// Deliver a service request to the watch. Ignored entirely while the
    /// crew member is offline. When the crew is available the request
    /// auto-accepts after a fixed delay unless it was removed first.
    pub async fn receive_service_request(self: &Arc<Self>, request_id: &str, details: serde_json::Value) {
        let was_available = {
            let mut state = self.state.lock().await;
            if state.crew_status == CrewStatus::Offline {
                return;
            }
            state.active_requests.push(request_id.into());
            state.crew_status == CrewStatus::Available
        };

        self.core
            .publish(
                "notification",
                json!({
                    "request_id": request_id,
                    "vibration": [200, 100, 200],
                    "details": details,
                }),
            )
            .await;
        self.core.recorder().record(
            EventKind::RequestReceived,
            json!({ "request_id": request_id }),
        );

        if was_available {
            let watch = Arc::clone(self);
            let cancel = self.core.child_token();
            let delay = self.core.timing().auto_accept();
            let id = request_id.to_owned();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        watch.accept_request(&id).await;
                    }
                }
            });
        }
    }

    /// Accept an in-flight request. A request already removed from the queue
    /// is a silent no-op.
    pub async fn accept_request(self: &Arc<Self>, request_id: &str) {
        {
            let mut state = self.state.lock().await;
            if !state.active_requests.iter().any(|r| r.as_ref() == request_id) {
                return;
            }
            state.crew_status = CrewStatus::Busy;
        }
        self.core
            .publish("request/accept", json!({ "request_id": request_id }))
            .await;
        self.core.recorder().record(
            EventKind::RequestAccepted,
            json!({ "request_id": request_id }),
        );
    }

    pub async fn decline_request(self: &Arc<Self>, request_id: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            let before = state.active_requests.len();
            state.active_requests.retain(|r| r.as_ref() != request_id);
            let removed = state.active_requests.len() < before;
            if removed && state.active_requests.is_empty() && state.crew_status == CrewStatus::Busy {
                state.crew_status = CrewStatus::Available;
            }
            removed
        };
        if !removed {
            return;
        }
        self.core
            .publish("request/decline", json!({ "request_id": request_id }))
            .await;
        self.core.recorder().record(
            EventKind::RequestDeclined,
            json!({ "request_id": request_id }),
        );
    }

    /// Complete an in-flight request. Status returns to available only once
    /// the queue is empty.
    pub async fn complete_request(self: &Arc<Self>, request_id: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            let before = state.active_requests.len();
            state.active_requests.retain(|r| r.as_ref() != request_id);
            let removed = state.active_requests.len() < before;
            if removed && state.active_requests.is_empty() {
                state.crew_status = CrewStatus::Available;
            }
            removed
        };
        if !removed {
            return;
        }
        self.core
            .publish("request/complete", json!({ "request_id": request_id }))
            .await;
        self.core.recorder().record(
            EventKind::RequestCompleted,
            json!({ "request_id": request_id }),
        );
    }

    /// Publish an emergency payload with the current location. Crew status is
    /// deliberately left unchanged: an SOS is about the wearer, not the duty
    /// roster.
    pub async fn send_sos(self: &Arc<Self>, message: Option<&str>) {
        let (location, crew_id) = {
            let state = self.state.lock().await;
            (state.location, state.crew_id.clone())
        };

        self.core.drain_battery(SOS_DRAIN).await;
        self.core
            .publish(
                "sos",
                json!({
                    "message": message.unwrap_or("SOS"),
                    "lat": location.lat,
                    "lng": location.lng,
                    "crew_id": crew_id,
                }),
            )
            .await;
        self.core.recorder().record(
            EventKind::Sos,
            json!({
                "message": message.unwrap_or("SOS"),
                "lat": location.lat,
                "lng": location.lng,
            }),
        );
        warn!(device_id = %self.core.id(), "SOS sent");
    }

    /// Publish a fall event; an automatic SOS follows after a short delay,
    /// modeling the fall-detection pipeline.
    pub async fn simulate_fall(self: &Arc<Self>) {
        let location = self.location().await;
        self.core
            .publish(
                "fall",
                json!({
                    "lat": location.lat,
                    "lng": location.lng,
                    "impact_g": rand::rng().random_range(2.5..6.0),
                }),
            )
            .await;
        self.core
            .recorder()
            .record(EventKind::Fall, json!({ "lat": location.lat, "lng": location.lng }));
        warn!(device_id = %self.core.id(), "Fall detected");

        let watch = Arc::clone(self);
        let cancel = self.core.child_token();
        let delay = self.core.timing().fall_sos();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    watch.send_sos(Some("fall detected, automatic alert")).await;
                }
            }
        });
    }

    /// Drive periodic location updates following a pattern until the duration
    /// elapses. Starting a new pattern replaces the previous one.
    pub async fn simulate_movement(self: &Arc<Self>, pattern: MovementPattern, duration: Duration) {
        let token = self.core.child_token();
        {
            let mut state = self.state.lock().await;
            if let Some(prev) = state.movement.replace(token.clone()) {
                prev.cancel();
            }
        }

        let watch = Arc::clone(self);
        let step = self.core.timing().movement_step();
        tokio::spawn(async move {
            let origin = watch.location().await;
            let deadline = tokio::time::Instant::now() + duration;
            let mut interval = tokio::time::interval(step);
            interval.tick().await;
            let mut step_index: u32 = 0;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = interval.tick() => {
                        let current = watch.location().await;
                        let next = match pattern {
                            MovementPattern::Patrol => {
                                // Walk the corners of a square around the origin.
                                let corners = [
                                    (0.0, 0.0),
                                    (PATROL_STEP_DEG, 0.0),
                                    (PATROL_STEP_DEG, PATROL_STEP_DEG),
                                    (0.0, PATROL_STEP_DEG),
                                ];
                                let (dlat, dlng) = corners[(step_index as usize) % corners.len()];
                                GeoPoint::new(origin.lat + dlat, origin.lng + dlng)
                            }
                            MovementPattern::RandomWalk => {
                                let mut rng = rand::rng();
                                GeoPoint::new(
                                    current.lat + rng.random_range(-WALK_STEP_DEG..WALK_STEP_DEG),
                                    current.lng + rng.random_range(-WALK_STEP_DEG..WALK_STEP_DEG),
                                )
                            }
                            MovementPattern::Stationary => current,
                        };
                        step_index += 1;
                        watch.update_location(next).await;
                    }
                }
            }
        });
    }

    /// Stop any running movement pattern.
    pub async fn stop_movement(&self) {
        let mut state = self.state.lock().await;
        if let Some(token) = state.movement.take() {
            token.cancel();
        }
    }
}
