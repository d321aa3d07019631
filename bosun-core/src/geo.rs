use serde::{Deserialize, Serialize};

/// Earth mean radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A WGS-84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Great-circle distance between two points, in meters.
pub fn haversine_meters(from: GeoPoint, to: GeoPoint) -> f64 {
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();
    let dlat = (to.lat - from.lat).to_radians();
    let dlng = (to.lng - from.lng).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Initial bearing from `from` to `to`, in degrees 0–360.
pub fn bearing_degrees(from: GeoPoint, to: GeoPoint) -> f64 {
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();
    let dlng = (to.lng - from.lng).to_radians();

    let y = dlng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlng.cos();

    (y.atan2(x).to_degrees() + 360.0) % 360.0
}
