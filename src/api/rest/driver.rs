use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::engine::machine::{DriverAction, DriverView};
use crate::engine::sync::SyncTrigger;
use crate::error::AppError;
use crate::models::driver::{GeoPoint, VehicleType};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/driver", get(get_driver))
        .route("/driver/online", post(go_online))
        .route("/driver/offline", post(go_offline))
        .route("/driver/location", post(update_location))
        .route("/sync", post(force_sync))
        .route("/session/logout", post(logout))
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct GoOnlineRequest {
    pub vehicle_type: Option<VehicleType>,
    pub pickup_location: Option<String>,
}

#[derive(Serialize)]
pub struct LocationResponse {
    pub sent: bool,
}

#[derive(Serialize)]
pub struct SyncResponse {
    pub decision: &'static str,
}

#[derive(Serialize)]
pub struct LogoutResponse {
    pub status: &'static str,
}

async fn get_driver(State(state): State<Arc<AppState>>) -> Json<DriverView> {
    Json(state.session.view())
}

async fn go_online(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<GoOnlineRequest>,
) -> Result<Json<DriverView>, AppError> {
    let pickup_location = payload
        .pickup_location
        .map(|location| location.trim().to_string())
        .filter(|location| !location.is_empty());

    let view = state
        .session
        .act(DriverAction::GoOnline {
            vehicle_type: payload.vehicle_type,
            pickup_location,
        })
        .await?;
    Ok(Json(view))
}

async fn go_offline(State(state): State<Arc<AppState>>) -> Result<Json<DriverView>, AppError> {
    let view = state.session.act(DriverAction::GoOffline).await?;
    Ok(Json(view))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Json(point): Json<GeoPoint>,
) -> Result<Json<LocationResponse>, AppError> {
    let sent = state.session.report_location(point)?;
    Ok(Json(LocationResponse { sent }))
}

async fn force_sync(State(state): State<Arc<AppState>>) -> Result<Json<SyncResponse>, AppError> {
    let decision = state.session.sync(SyncTrigger::Forced).await?;
    Ok(Json(SyncResponse {
        decision: decision.as_str(),
    }))
}

async fn logout(State(state): State<Arc<AppState>>) -> Result<Json<LogoutResponse>, AppError> {
    state.session.logout().await?;
    state.request_shutdown();
    Ok(Json(LogoutResponse {
        status: "signed_out",
    }))
}
