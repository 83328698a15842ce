use chrono::{DateTime, TimeDelta, Utc};

use crate::geo::{haversine_m, is_valid};
use crate::models::driver::GeoPoint;

/// Decides whether a geolocation fix is worth sending. Reads driver state,
/// never changes it.
#[derive(Debug, Clone)]
pub struct LocationGate {
    min_interval: TimeDelta,
    min_distance_m: f64,
    last_sent: Option<(GeoPoint, DateTime<Utc>)>,
}

impl LocationGate {
    pub fn new(min_interval: TimeDelta, min_distance_m: f64) -> Self {
        Self {
            min_interval,
            min_distance_m,
            last_sent: None,
        }
    }

    /// Returns true and remembers the fix when it should go out.
    pub fn admit(&mut self, point: GeoPoint, online: bool, now: DateTime<Utc>) -> bool {
        if !online || !is_valid(&point) {
            return false;
        }

        let due = match &self.last_sent {
            None => true,
            Some((last_point, last_at)) => {
                now - *last_at >= self.min_interval
                    && haversine_m(last_point, &point) >= self.min_distance_m
            }
        };

        if due {
            self.last_sent = Some((point, now));
        }
        due
    }

    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}
