//! Directory service payloads.
//!
//! These travel inside local-service requests between a role server and the
//! upstream location directory. The server core only carries them; their
//! meaning belongs to the directory.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point scale of [`GpsLocation`] coordinates.
pub const GPS_SCALE: f64 = 1_000_000.0;

/// Kind of service a node announces to the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    Unstructured,
    Content,
    Latency,
    Location,
    Token,
    Profile,
    Proximity,
    Relay,
    Reputation,
    Minting,
}

/// One service announced by a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_type: ServiceType,
    pub port: u16,
    pub service_data: Vec<u8>,
}

/// GPS position in millionths of a degree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpsLocation {
    pub latitude: i32,
    pub longitude: i32,
}

impl GpsLocation {
    /// Create from fixed-point coordinates.
    pub fn new(latitude: i32, longitude: i32) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Create from degrees, rounding to the nearest millionth.
    pub fn from_degrees(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude: (latitude * GPS_SCALE).round() as i32,
            longitude: (longitude * GPS_SCALE).round() as i32,
        }
    }

    /// Latitude in degrees.
    pub fn latitude_degrees(&self) -> f64 {
        self.latitude as f64 / GPS_SCALE
    }

    /// Longitude in degrees.
    pub fn longitude_degrees(&self) -> f64 {
        self.longitude as f64 / GPS_SCALE
    }

    /// Latitude must lie in [-90, 90] and longitude in (-180, 180].
    pub fn is_valid(&self) -> bool {
        let lat_ok = (-90_000_000..=90_000_000).contains(&self.latitude);
        let lon_ok = self.longitude > -180_000_000 && self.longitude <= 180_000_000;
        lat_ok && lon_ok
    }
}

impl fmt::Display for GpsLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6},{:.6}",
            self.latitude_degrees(),
            self.longitude_degrees()
        )
    }
}

/// A node known to the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: Vec<u8>,
    pub ip_address: Vec<u8>,
    pub port: u16,
    pub location: GpsLocation,
    pub services: Vec<ServiceInfo>,
}

/// One change in the neighbourhood pushed by the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighbourhoodChange {
    Added(NodeInfo),
    Updated(NodeInfo),
    Removed(Vec<u8>),
}
