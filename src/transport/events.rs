use serde::{Deserialize, Serialize};

use crate::engine::ride::OtpPhase;
use crate::models::driver::{GeoPoint, VehicleType};
use crate::models::ride::{Otp, Ride, RideRequest};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OnlineConfirmed {
    #[serde(default)]
    pub queue_position: Option<u32>,
    #[serde(default)]
    pub pickup_location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OfflineConfirmed {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceptConfirmed {
    #[serde(alias = "id")]
    pub ride_id: String,
    #[serde(default, alias = "queuePosition", alias = "boothNumber")]
    pub queue_number: Option<u32>,
    #[serde(default, rename = "startOTP", alias = "startOtp")]
    pub start_otp: Option<Otp>,
    #[serde(default, rename = "endOTP", alias = "endOtp")]
    pub end_otp: Option<Otp>,
    /// Full ride record, when the server sends one along.
    #[serde(default)]
    pub ride: Option<Ride>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AcceptError {
    #[serde(default, alias = "id")]
    pub ride_id: Option<String>,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RideAssigned {
    pub ride: Ride,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OtpVerified {
    #[serde(alias = "id")]
    pub ride_id: String,
    #[serde(default, alias = "type")]
    pub phase: Option<OtpPhase>,
    #[serde(default, rename = "endOTP", alias = "endOtp")]
    pub end_otp: Option<Otp>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OtpRejected {
    #[serde(default, alias = "id")]
    pub ride_id: Option<String>,
    #[serde(default, alias = "type")]
    pub phase: Option<OtpPhase>,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideProgress {
    #[serde(alias = "id")]
    pub ride_id: String,
    #[serde(default, rename = "endOTP", alias = "endOtp")]
    pub end_otp: Option<Otp>,
    #[serde(default)]
    pub fare: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideCancelled {
    #[serde(alias = "id")]
    pub ride_id: String,
    #[serde(default)]
    pub cancelled_by: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideRef {
    #[serde(alias = "id")]
    pub ride_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdate {
    #[serde(default)]
    pub queue_position: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusOverride {
    #[serde(alias = "online")]
    pub is_online: bool,
    #[serde(default)]
    pub queue_position: Option<u32>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Events pushed by the dispatch server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum InboundEvent {
    DriverOnlineConfirmed(OnlineConfirmed),
    DriverOfflineConfirmed(OfflineConfirmed),
    NewRideRequest(RideRequest),
    RideAcceptConfirmed(AcceptConfirmed),
    RideAcceptError(AcceptError),
    RideAssigned(RideAssigned),
    OtpVerificationSuccess(OtpVerified),
    OtpVerificationError(OtpRejected),
    RideStarted(RideProgress),
    RideEnded(RideProgress),
    RideCompleted(RideProgress),
    RideCancelled(RideCancelled),
    /// Another driver won a request this driver could see.
    RideTaken(RideRef),
    QueuePositionUpdated(QueueUpdate),
    DriverStatusUpdated(StatusOverride),
    StatusChangedByAdmin(StatusOverride),
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::DriverOnlineConfirmed(_) => "driverOnlineConfirmed",
            InboundEvent::DriverOfflineConfirmed(_) => "driverOfflineConfirmed",
            InboundEvent::NewRideRequest(_) => "newRideRequest",
            InboundEvent::RideAcceptConfirmed(_) => "rideAcceptConfirmed",
            InboundEvent::RideAcceptError(_) => "rideAcceptError",
            InboundEvent::RideAssigned(_) => "rideAssigned",
            InboundEvent::OtpVerificationSuccess(_) => "otpVerificationSuccess",
            InboundEvent::OtpVerificationError(_) => "otpVerificationError",
            InboundEvent::RideStarted(_) => "rideStarted",
            InboundEvent::RideEnded(_) => "rideEnded",
            InboundEvent::RideCompleted(_) => "rideCompleted",
            InboundEvent::RideCancelled(_) => "rideCancelled",
            InboundEvent::RideTaken(_) => "rideTaken",
            InboundEvent::QueuePositionUpdated(_) => "queuePositionUpdated",
            InboundEvent::DriverStatusUpdated(_) => "driverStatusUpdated",
            InboundEvent::StatusChangedByAdmin(_) => "statusChangedByAdmin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverIdentity {
    pub driver_id: String,
    pub vehicle_type: Option<VehicleType>,
    pub pickup_location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverRef {
    pub driver_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceptRide {
    pub ride_id: String,
    pub driver_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtp {
    pub ride_id: String,
    pub otp: Otp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancelRide {
    pub ride_id: String,
    pub driver_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub driver_id: String,
    pub location: GeoPoint,
    pub ride_id: Option<String>,
}

/// Events this client sends to the dispatch server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundEvent {
    /// Sent on every (re)connect so the server routes driver events here again.
    RegisterDriver(DriverIdentity),
    DriverGoOnline(DriverIdentity),
    DriverGoOffline(DriverRef),
    DriverAcceptRide(AcceptRide),
    #[serde(rename = "verifyStartOTP")]
    VerifyStartOtp(VerifyOtp),
    #[serde(rename = "verifyEndOTP")]
    VerifyEndOtp(VerifyOtp),
    CancelRide(CancelRide),
    UpdateDriverLocation(LocationUpdate),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::RegisterDriver(_) => "registerDriver",
            OutboundEvent::DriverGoOnline(_) => "driverGoOnline",
            OutboundEvent::DriverGoOffline(_) => "driverGoOffline",
            OutboundEvent::DriverAcceptRide(_) => "driverAcceptRide",
            OutboundEvent::VerifyStartOtp(_) => "verifyStartOTP",
            OutboundEvent::VerifyEndOtp(_) => "verifyEndOTP",
            OutboundEvent::CancelRide(_) => "cancelRide",
            OutboundEvent::UpdateDriverLocation(_) => "updateDriverLocation",
        }
    }

    /// Whether the server answers this event through an ack callback.
    pub fn expects_ack(&self) -> bool {
        match self {
            OutboundEvent::DriverGoOnline(_)
            | OutboundEvent::DriverGoOffline(_)
            | OutboundEvent::DriverAcceptRide(_)
            | OutboundEvent::VerifyStartOtp(_)
            | OutboundEvent::VerifyEndOtp(_)
            | OutboundEvent::CancelRide(_) => true,
            OutboundEvent::RegisterDriver(_) | OutboundEvent::UpdateDriverLocation(_) => false,
        }
    }
}
