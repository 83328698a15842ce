use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AppError;
use crate::models::driver::{GeoPoint, VehicleType};

pub const OTP_LENGTH: usize = 4;

/// Four-digit code shown to the rider and typed in by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Otp(String);

impl Otp {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let trimmed = raw.trim();
        if trimmed.len() != OTP_LENGTH || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AppError::Validation(format!(
                "OTP must be exactly {OTP_LENGTH} digits"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, candidate: &Otp) -> bool {
        self.0 == candidate.0
    }
}

impl fmt::Display for Otp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Otp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOtp {
    Text(String),
    Number(u32),
}

impl<'de> Deserialize<'de> for Otp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = match RawOtp::deserialize(deserializer)? {
            RawOtp::Text(text) => text,
            RawOtp::Number(number) => format!("{number:04}"),
        };
        Otp::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,
    Accepted,
    RideStarted,
    /// End OTP verified, payment still being collected.
    RideEnded,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            RideStatus::Accepted | RideStatus::RideStarted | RideStatus::RideEnded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Pending => "pending",
            RideStatus::Accepted => "accepted",
            RideStatus::RideStarted => "ride_started",
            RideStatus::RideEnded => "ride_ended",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Rider {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Rider {
    pub fn is_known(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.trim().is_empty())
            || self.phone.as_deref().is_some_and(|p| !p.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RideTimestamps {
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl RideTimestamps {
    pub fn stamp(&mut self, status: RideStatus, at: DateTime<Utc>) {
        let slot = match status {
            RideStatus::Pending => &mut self.requested_at,
            RideStatus::Accepted => &mut self.accepted_at,
            RideStatus::RideStarted => &mut self.started_at,
            RideStatus::RideEnded => &mut self.ended_at,
            RideStatus::Completed => &mut self.completed_at,
            RideStatus::Cancelled => &mut self.cancelled_at,
        };
        slot.get_or_insert(at);
    }

    fn fill_from(&mut self, other: &RideTimestamps) {
        self.requested_at = self.requested_at.or(other.requested_at);
        self.accepted_at = self.accepted_at.or(other.accepted_at);
        self.started_at = self.started_at.or(other.started_at);
        self.ended_at = self.ended_at.or(other.ended_at);
        self.completed_at = self.completed_at.or(other.completed_at);
        self.cancelled_at = self.cancelled_at.or(other.cancelled_at);
    }
}

/// A ride after a driver claimed it. The server may send records with
/// missing fields (including a `null` status), so almost everything is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ride {
    #[serde(alias = "rideId", alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub status: Option<RideStatus>,
    #[serde(default)]
    pub rider: Rider,
    #[serde(default)]
    pub pickup: Option<Place>,
    #[serde(default)]
    pub drop: Option<Place>,
    #[serde(default)]
    pub vehicle_type: Option<VehicleType>,
    #[serde(default)]
    pub estimated_fare: Option<f64>,
    #[serde(default)]
    pub fare: Option<f64>,
    #[serde(default, rename = "startOTP", alias = "startOtp")]
    pub start_otp: Option<Otp>,
    #[serde(default, rename = "endOTP", alias = "endOtp")]
    pub end_otp: Option<Otp>,
    /// Booth sequence number handed out at acceptance.
    #[serde(default)]
    pub queue_number: Option<u32>,
    #[serde(default)]
    pub timestamps: RideTimestamps,
}

impl Ride {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: None,
            rider: Rider::default(),
            pickup: None,
            drop: None,
            vehicle_type: None,
            estimated_fare: None,
            fare: None,
            start_otp: None,
            end_otp: None,
            queue_number: None,
            timestamps: RideTimestamps::default(),
        }
    }

    pub fn from_request(request: &RideRequest) -> Self {
        let mut ride = Ride::new(request.ride_id.clone());
        ride.status = Some(RideStatus::Pending);
        ride.rider = request.rider.clone();
        ride.pickup = request.pickup.clone();
        ride.drop = request.drop.clone();
        ride.vehicle_type = request.vehicle_type;
        ride.estimated_fare = request.estimated_fare;
        ride.timestamps.requested_at = request.received_at;
        ride
    }

    /// A record without a status is treated as not yet accepted.
    pub fn effective_status(&self) -> RideStatus {
        self.status.unwrap_or(RideStatus::Pending)
    }

    pub fn otp_count(&self) -> u8 {
        u8::from(self.start_otp.is_some()) + u8::from(self.end_otp.is_some())
    }

    pub fn has_otp(&self) -> bool {
        self.otp_count() > 0
    }

    pub fn has_fare(&self) -> bool {
        self.fare.is_some() || self.estimated_fare.is_some()
    }

    /// True while an OTP gate is still ahead of this ride.
    pub fn has_pending_otp(&self) -> bool {
        match self.effective_status() {
            RideStatus::Pending | RideStatus::Accepted => {
                self.start_otp.is_some() || self.end_otp.is_some()
            }
            RideStatus::RideStarted => self.end_otp.is_some(),
            RideStatus::RideEnded | RideStatus::Completed | RideStatus::Cancelled => false,
        }
    }

    pub fn set_status(&mut self, status: RideStatus, at: DateTime<Utc>) {
        self.status = Some(status);
        self.timestamps.stamp(status, at);
    }

    /// Copies every field `self` lacks from `other`. Never overwrites.
    pub fn fill_missing_from(&mut self, other: &Ride) {
        if self.status.is_none() {
            self.status = other.status;
        }
        if self.start_otp.is_none() {
            self.start_otp = other.start_otp.clone();
        }
        if self.end_otp.is_none() {
            self.end_otp = other.end_otp.clone();
        }
        if self.fare.is_none() {
            self.fare = other.fare;
        }
        if self.estimated_fare.is_none() {
            self.estimated_fare = other.estimated_fare;
        }
        if self.rider.name.is_none() {
            self.rider.name = other.rider.name.clone();
        }
        if self.rider.phone.is_none() {
            self.rider.phone = other.rider.phone.clone();
        }
        if self.pickup.is_none() {
            self.pickup = other.pickup.clone();
        }
        if self.drop.is_none() {
            self.drop = other.drop.clone();
        }
        if self.vehicle_type.is_none() {
            self.vehicle_type = other.vehicle_type;
        }
        if self.queue_number.is_none() {
            self.queue_number = other.queue_number;
        }
        self.timestamps.fill_from(&other.timestamps);
    }
}

/// A ride offer broadcast to online drivers, before anyone claimed it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideRequest {
    #[serde(alias = "id", alias = "_id")]
    pub ride_id: String,
    #[serde(default)]
    pub rider: Rider,
    #[serde(default)]
    pub pickup: Option<Place>,
    #[serde(default)]
    pub drop: Option<Place>,
    #[serde(default)]
    pub vehicle_type: Option<VehicleType>,
    #[serde(default, alias = "fare")]
    pub estimated_fare: Option<f64>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}
