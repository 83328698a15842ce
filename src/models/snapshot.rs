use serde::{Deserialize, Serialize};

use crate::models::driver::VehicleType;
use crate::models::ride::Ride;

/// The part of driver state the server cares about. Two equal snapshots mean
/// there is nothing new to tell it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub is_online: bool,
    pub queue_position: Option<u32>,
    pub active_ride_id: Option<String>,
    pub vehicle_type: Option<VehicleType>,
    pub pickup_location: Option<String>,
}

/// Driver state as the server sees it, returned by state sync and by the
/// driver-status recovery call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerDriverState {
    #[serde(alias = "online")]
    pub is_online: bool,
    #[serde(default)]
    pub queue_position: Option<u32>,
    #[serde(default)]
    pub vehicle_type: Option<VehicleType>,
    #[serde(default)]
    pub pickup_location: Option<String>,
    #[serde(default, alias = "currentRide")]
    pub active_ride: Option<Ride>,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::SyncSnapshot;
    use crate::models::driver::VehicleType;

    #[test]
    fn equal_snapshots_hash_the_same() {
        let a = SyncSnapshot {
            is_online: true,
            queue_position: Some(3),
            active_ride_id: None,
            vehicle_type: Some(VehicleType::Auto),
            pickup_location: Some("booth-7".to_string()),
        };
        let b = a.clone();

        let set: HashSet<SyncSnapshot> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }
}
