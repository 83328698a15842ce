//! Completeness-ranked merge of ride records.

use std::cmp::Ordering;

use serde::Serialize;
use tracing::{debug, warn};

use crate::models::ride::Ride;

/// Where an incoming record came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Tiered<T> {
    /// Reported by the server.
    Authoritative(T),
    /// Restored from local storage.
    Cached(T),
}

impl<T> Tiered<T> {
    pub fn into_value(self) -> T {
        match self {
            Tiered::Authoritative(value) | Tiered::Cached(value) => value,
        }
    }

    pub fn is_authoritative(&self) -> bool {
        matches!(self, Tiered::Authoritative(_))
    }

    pub fn source(&self) -> &'static str {
        match self {
            Tiered::Authoritative(_) => "server",
            Tiered::Cached(_) => "storage",
        }
    }
}

/// How much a ride record knows. Compared lexicographically: OTPs first,
/// then fare, then rider identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Completeness {
    pub otps: u8,
    pub fare: bool,
    pub identity: bool,
}

impl Completeness {
    pub fn of(ride: &Ride) -> Self {
        Self {
            otps: ride.otp_count(),
            fare: ride.has_fare(),
            identity: ride.rider.is_known(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Both sides empty or identical.
    Unchanged,
    /// Nothing was held; the incoming record was taken.
    Adopted,
    /// Same ride; the held record ranked at least as high.
    KeptHeld,
    /// Same ride; the incoming record ranked higher.
    TookIncoming,
    /// Server said there is no active ride but the held one is still in flight.
    ServerDisagreementIgnored,
    /// Server said there is no active ride and the held one was disposable.
    Cleared,
    /// Server reported a different ride than the one held.
    Replaced,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Unchanged => "unchanged",
            Outcome::Adopted => "adopted",
            Outcome::KeptHeld => "kept_held",
            Outcome::TookIncoming => "took_incoming",
            Outcome::ServerDisagreementIgnored => "server_disagreement_ignored",
            Outcome::Cleared => "cleared",
            Outcome::Replaced => "replaced",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub ride: Option<Ride>,
    pub outcome: Outcome,
}

/// Picks the winner between two records of the same ride and back-fills the
/// winner's gaps from the loser. Ties go to `held`.
pub fn merge_same_ride(held: &Ride, incoming: &Ride) -> (Ride, Outcome) {
    let held_rank = Completeness::of(held);
    let incoming_rank = Completeness::of(incoming);

    let (mut winner, loser, outcome) = match incoming_rank.cmp(&held_rank) {
        Ordering::Greater => (incoming.clone(), held, Outcome::TookIncoming),
        Ordering::Equal | Ordering::Less => (held.clone(), incoming, Outcome::KeptHeld),
    };
    winner.fill_missing_from(loser);

    debug!(
        ride_id = %held.id,
        ?held_rank,
        ?incoming_rank,
        outcome = outcome.as_str(),
        "merged ride records"
    );

    (winner, outcome)
}

/// Resolves the single active ride from what is held in memory and what just
/// arrived from storage or the server.
pub fn reconcile_ride(held: Option<&Ride>, incoming: Tiered<Option<Ride>>) -> Resolution {
    let authoritative = incoming.is_authoritative();
    let source = incoming.source();

    match (held, incoming.into_value()) {
        (None, None) => Resolution {
            ride: None,
            outcome: Outcome::Unchanged,
        },
        (None, Some(ride)) => Resolution {
            ride: Some(ride),
            outcome: Outcome::Adopted,
        },
        (Some(held), None) if !authoritative => Resolution {
            ride: Some(held.clone()),
            outcome: Outcome::Unchanged,
        },
        (Some(held), None) => {
            if held.has_otp() || held.effective_status().is_in_progress() {
                warn!(
                    ride_id = %held.id,
                    status = %held.effective_status(),
                    has_otp = held.has_otp(),
                    "server reports no active ride; keeping local ride"
                );
                Resolution {
                    ride: Some(held.clone()),
                    outcome: Outcome::ServerDisagreementIgnored,
                }
            } else {
                Resolution {
                    ride: None,
                    outcome: Outcome::Cleared,
                }
            }
        }
        (Some(held), Some(ride)) if held.id == ride.id => {
            if *held == ride {
                return Resolution {
                    ride: Some(ride),
                    outcome: Outcome::Unchanged,
                };
            }
            let (merged, outcome) = merge_same_ride(held, &ride);
            Resolution {
                ride: Some(merged),
                outcome,
            }
        }
        (Some(held), Some(ride)) if authoritative => {
            warn!(
                held_ride_id = %held.id,
                server_ride_id = %ride.id,
                "server reports a different active ride; replacing local ride"
            );
            Resolution {
                ride: Some(ride),
                outcome: Outcome::Replaced,
            }
        }
        (Some(held), Some(ride)) => {
            debug!(
                held_ride_id = %held.id,
                stored_ride_id = %ride.id,
                source,
                "ignoring stale stored ride"
            );
            Resolution {
                ride: Some(held.clone()),
                outcome: Outcome::KeptHeld,
            }
        }
    }
}
