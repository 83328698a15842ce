use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;

use crate::backend::{HistoryPage, HistoryQuery};
use crate::engine::machine::{DriverAction, DriverView};
use crate::engine::ride::OtpPhase;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rides/:id/accept", post(accept_ride))
        .route("/rides/:id/decline", post(decline_ride))
        .route("/rides/history", get(ride_history))
        .route("/ride/otp", post(verify_otp))
        .route("/ride/cancel", post(cancel_ride))
}

#[derive(Deserialize)]
pub struct VerifyOtpRequest {
    pub phase: OtpPhase,
    pub otp: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct CancelRequest {
    pub confirmed: bool,
    pub reason: Option<String>,
}

async fn accept_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<String>,
) -> Result<Json<DriverView>, AppError> {
    let view = state.session.act(DriverAction::AcceptRide { ride_id }).await?;
    Ok(Json(view))
}

async fn decline_ride(
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<String>,
) -> Result<Json<DriverView>, AppError> {
    let view = state.session.act(DriverAction::DeclineRide { ride_id }).await?;
    Ok(Json(view))
}

async fn verify_otp(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<VerifyOtpRequest>,
) -> Result<Json<DriverView>, AppError> {
    let view = state
        .session
        .act(DriverAction::VerifyOtp {
            phase: payload.phase,
            code: payload.otp,
        })
        .await?;
    Ok(Json(view))
}

async fn cancel_ride(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<DriverView>, AppError> {
    let reason = payload
        .reason
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty());
    let view = state
        .session
        .act(DriverAction::CancelRide {
            confirmed: payload.confirmed,
            reason,
        })
        .await?;
    Ok(Json(view))
}

async fn ride_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, AppError> {
    if query.limit == 0 {
        return Err(AppError::Validation("limit must be > 0".to_string()));
    }
    let page = state.session.history(query).await?;
    Ok(Json(page))
}
