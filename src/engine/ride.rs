use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::ride::{Otp, Ride, RideStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RideEvent {
    AcceptConfirmed,
    /// Another driver won the request or the requester withdrew it.
    Withdrawn,
    StartVerified,
    EndVerified,
    Completed,
    Cancel,
}

impl RideEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideEvent::AcceptConfirmed => "accept_confirmed",
            RideEvent::Withdrawn => "withdrawn",
            RideEvent::StartVerified => "start_verified",
            RideEvent::EndVerified => "end_verified",
            RideEvent::Completed => "completed",
            RideEvent::Cancel => "cancel",
        }
    }
}

/// The ride transition table. Every pair not listed is rejected.
pub fn next_status(from: RideStatus, event: RideEvent) -> Result<RideStatus, AppError> {
    use RideEvent as E;
    use RideStatus as S;

    match (from, event) {
        (S::Pending, E::AcceptConfirmed) => Ok(S::Accepted),
        (S::Pending, E::Withdrawn) => Ok(S::Cancelled),
        (S::Accepted, E::StartVerified) => Ok(S::RideStarted),
        (S::RideStarted, E::EndVerified) => Ok(S::RideEnded),
        (S::RideEnded, E::Completed) => Ok(S::Completed),
        (S::Pending | S::Accepted | S::RideStarted | S::RideEnded, E::Cancel) => Ok(S::Cancelled),
        (
            S::Pending,
            E::StartVerified | E::EndVerified | E::Completed,
        )
        | (
            S::Accepted,
            E::AcceptConfirmed | E::Withdrawn | E::EndVerified | E::Completed,
        )
        | (
            S::RideStarted,
            E::AcceptConfirmed | E::Withdrawn | E::StartVerified | E::Completed,
        )
        | (
            S::RideEnded,
            E::AcceptConfirmed | E::Withdrawn | E::StartVerified | E::EndVerified,
        )
        | (S::Completed | S::Cancelled, _) => Err(AppError::Guard(format!(
            "ride in status {from} cannot take {}",
            event.as_str()
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtpPhase {
    Start,
    End,
}

impl OtpPhase {
    pub fn required_status(&self) -> RideStatus {
        match self {
            OtpPhase::Start => RideStatus::Accepted,
            OtpPhase::End => RideStatus::RideStarted,
        }
    }

    pub fn verified_event(&self) -> RideEvent {
        match self {
            OtpPhase::Start => RideEvent::StartVerified,
            OtpPhase::End => RideEvent::EndVerified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OtpPhase::Start => "start",
            OtpPhase::End => "end",
        }
    }
}

/// What stands between the ride and its next phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpGate<'a> {
    Required(&'a Otp),
    /// The server never issued a code for this phase; the ride advances without one.
    NotIssued,
}

pub fn otp_gate(ride: &Ride, phase: OtpPhase) -> OtpGate<'_> {
    let expected = match phase {
        OtpPhase::Start => ride.start_otp.as_ref(),
        OtpPhase::End => ride.end_otp.as_ref(),
    };
    match expected {
        Some(otp) => OtpGate::Required(otp),
        None => OtpGate::NotIssued,
    }
}
