//! Calls to the authoritative dispatch server's REST API.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::ride::{Ride, RideStatus};
use crate::models::snapshot::{ServerDriverState, SyncSnapshot};

pub use http::HttpDispatchApi;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub driver_id: String,
    pub snapshot: SyncSnapshot,
    pub active_ride: Option<Ride>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryQuery {
    pub page: u32,
    pub limit: u32,
    pub status: Option<RideStatus>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            status: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub rides: Vec<Ride>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub total: u64,
}

#[async_trait]
pub trait DispatchApi: Send + Sync {
    /// Pushes the full local snapshot; the server answers with its own view.
    async fn push_state(&self, request: &SyncRequest) -> Result<ServerDriverState, AppError>;

    async fn fetch_driver_status(&self, driver_id: &str) -> Result<ServerDriverState, AppError>;

    async fn fetch_ride_history(
        &self,
        driver_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, AppError>;
}
