//! HTTP handler for the Compliance Guardian Agent
//!
//! Monitoring surface: status snapshot, on-demand sweep, consultation
//! voting, and the Prometheus scrape endpoint.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::contracts::{Notification, SessionStatus, StatusSnapshot, SweepReport};
use crate::engine::MonitoringEngine;
use crate::error::GuardianError;

/// Application state
pub struct AppState {
    pub engine: Arc<MonitoringEngine>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/guardian/status", get(guardian_status))
        .route("/api/v1/guardian/sweep", post(run_sweep))
        .route("/api/v1/consultations/:id/votes", post(cast_vote))
        .route("/metrics", get(scrape_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        agent_id: Notification::AGENT_ID.to_string(),
        agent_version: Notification::AGENT_VERSION.to_string(),
    })
}

/// Full status snapshot. Served even during degraded monitoring.
async fn guardian_status(State(state): State<Arc<AppState>>) -> Json<StatusSnapshot> {
    Json(state.engine.status().await)
}

/// Trigger one sweep outside the periodic schedule
async fn run_sweep(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<SweepReport>> {
    let report = state.engine.sweep().await;
    Json(ApiResponse {
        success: report.critical_count == 0,
        data: report,
    })
}

/// Record one representative's consultation vote
async fn cast_vote(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<VoteRequest>,
) -> Result<Json<VoteResponse>, (StatusCode, Json<ApiError>)> {
    if request.representative.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                error: "InvalidInput".to_string(),
                message: "representative must not be empty".to_string(),
            }),
        ));
    }

    let status = state
        .engine
        .coordinator()
        .cast_vote(session_id, &request.representative, request.approve)
        .await
        .map_err(vote_error)?;

    Ok(Json(VoteResponse { session_id, status }))
}

fn vote_error(e: GuardianError) -> (StatusCode, Json<ApiError>) {
    let (status, error) = match &e {
        GuardianError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SessionNotFound"),
        GuardianError::SessionClosed(_) => (StatusCode::CONFLICT, "SessionClosed"),
        GuardianError::DuplicateVote { .. } => (StatusCode::CONFLICT, "DuplicateVote"),
        GuardianError::UnknownRepresentative { .. } => {
            (StatusCode::FORBIDDEN, "UnknownRepresentative")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal"),
    };
    (
        status,
        Json(ApiError {
            error: error.to_string(),
            message: e.to_string(),
        }),
    )
}

/// Prometheus scrape endpoint
async fn scrape_metrics(
    State(state): State<Arc<AppState>>,
) -> Result<String, (StatusCode, Json<ApiError>)> {
    state.engine.metrics().gather().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError {
                error: "Telemetry".to_string(),
                message: e.to_string(),
            }),
        )
    })
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub agent_id: String,
    pub agent_version: String,
}

/// Vote request
#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub representative: String,
    pub approve: bool,
}

/// Vote response
#[derive(Debug, Serialize)]
pub struct VoteResponse {
    pub session_id: Uuid,
    pub status: SessionStatus,
}

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

/// API error
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}
