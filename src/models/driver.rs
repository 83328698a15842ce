use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Bike,
    Auto,
    Car,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Bike => "bike",
            VehicleType::Auto => "auto",
            VehicleType::Car => "car",
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleType {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bike" => Ok(VehicleType::Bike),
            "auto" => Ok(VehicleType::Auto),
            "car" => Ok(VehicleType::Car),
            other => Err(AppError::Validation(format!(
                "unknown vehicle type: {other}, expected bike/auto/car"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    #[default]
    Offline,
    /// Optimistic state between the user asking to go online and the server confirming it.
    GoingOnline,
    Online,
}

impl DriverStatus {
    pub fn is_online(&self) -> bool {
        *self == DriverStatus::Online
    }

    /// The status that may be written to durable storage. A pending go-online
    /// never survives a reload.
    pub fn durable(&self) -> DriverStatus {
        match self {
            DriverStatus::GoingOnline => DriverStatus::Offline,
            other => *other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub id: String,
    pub vehicle_type: Option<VehicleType>,
    pub status: DriverStatus,
    /// 1 = next in line at the pickup location.
    pub queue_position: Option<u32>,
    pub pickup_location: Option<String>,
    pub last_location: Option<GeoPoint>,
}

impl Driver {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}
