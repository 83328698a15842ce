use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AppError;
use crate::models::driver::{DriverStatus, VehicleType};
use crate::models::ride::Ride;
use crate::store::KeyValueStore;

const STATUS: &str = "status";
const QUEUE_POSITION: &str = "queue_position";
const ACTIVE_RIDE: &str = "active_ride";
const VEHICLE_TYPE: &str = "vehicle_type";
const PICKUP_LOCATION: &str = "pickup_location";
const LAST_SYNC: &str = "last_sync";

/// What survives a reload of the driver client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub status: DriverStatus,
    pub queue_position: Option<u32>,
    pub active_ride: Option<Ride>,
    pub vehicle_type: Option<VehicleType>,
    pub pickup_location: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Per-driver view over a shared key/value store. Keys never leak across drivers.
#[derive(Clone)]
pub struct DriverStore {
    backend: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl DriverStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, driver_id: &str) -> Self {
        Self {
            backend,
            prefix: format!("driver:{driver_id}:"),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    fn put<T: Serialize>(&self, name: &str, value: Option<&T>) -> Result<(), AppError> {
        let key = self.key(name);
        match value {
            Some(value) => {
                let raw = serde_json::to_string(value)
                    .map_err(|err| AppError::Storage(format!("failed to encode {key}: {err}")))?;
                self.backend.set(&key, &raw)
            }
            None => self.backend.remove(&key),
        }
    }

    /// Missing and unreadable values both come back as `None`.
    fn fetch<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let key = self.key(name);
        let raw = match self.backend.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to read stored value");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %key, error = %err, "discarding unreadable stored value");
                None
            }
        }
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), AppError> {
        let status = state.status.durable();
        self.put(STATUS, Some(&status))?;
        self.put(QUEUE_POSITION, state.queue_position.as_ref())?;
        self.put(ACTIVE_RIDE, state.active_ride.as_ref())?;
        self.put(VEHICLE_TYPE, state.vehicle_type.as_ref())?;
        self.put(PICKUP_LOCATION, state.pickup_location.as_ref())?;
        if let Some(at) = state.last_sync_at {
            self.put(LAST_SYNC, Some(&at))?;
        }
        Ok(())
    }

    pub fn load(&self) -> PersistedState {
        PersistedState {
            status: self.fetch::<DriverStatus>(STATUS).unwrap_or_default().durable(),
            queue_position: self.fetch(QUEUE_POSITION),
            active_ride: self.fetch(ACTIVE_RIDE),
            vehicle_type: self.fetch(VEHICLE_TYPE),
            pickup_location: self.fetch(PICKUP_LOCATION),
            last_sync_at: self.fetch(LAST_SYNC),
        }
    }

    pub fn record_sync(&self, at: DateTime<Utc>) -> Result<(), AppError> {
        self.put(LAST_SYNC, Some(&at))
    }

    pub fn clear(&self) -> Result<(), AppError> {
        self.backend.remove_prefix(&self.prefix)
    }
}
