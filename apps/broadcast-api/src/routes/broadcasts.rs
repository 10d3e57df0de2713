//! Broadcast lifecycle and statistics endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::broadcast::session::{AudioSource, BroadcastStats};
use crate::broadcast::ServerStats;
use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

const OPERATOR_END_REASON: &str = "The broadcast was ended by the station";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/broadcasts/{broadcast_id}/start", post(start_broadcast))
        .route("/broadcasts/{broadcast_id}/end", post(end_broadcast))
        .route("/broadcasts/{broadcast_id}/stats", get(broadcast_stats))
        .route("/broadcasts/{broadcast_id}/sources", get(list_sources))
        .route("/stats", get(server_stats))
}

// ---------------------------------------------------------------------------
// POST /api/v1/broadcasts/:broadcast_id/start
// ---------------------------------------------------------------------------

/// Open a session ahead of the broadcaster connecting. Idempotent.
#[utoipa::path(
    post,
    path = "/api/v1/broadcasts/{broadcast_id}/start",
    tag = "Broadcasts",
    params(("broadcast_id" = String, Path, description = "Broadcast ID")),
    responses(
        (status = 201, description = "Session open", body = BroadcastStats),
    ),
)]
pub async fn start_broadcast(
    State(state): State<AppState>,
    Path(broadcast_id): Path<String>,
) -> Result<(StatusCode, Json<BroadcastStats>), ApiError> {
    if broadcast_id.trim().is_empty() {
        return Err(ApiError::bad_request("Broadcast ID must not be empty"));
    }
    let stats = state.registry.open(&broadcast_id);
    Ok((StatusCode::CREATED, Json(stats)))
}

// ---------------------------------------------------------------------------
// POST /api/v1/broadcasts/:broadcast_id/end
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/broadcasts/{broadcast_id}/end",
    tag = "Broadcasts",
    params(("broadcast_id" = String, Path, description = "Broadcast ID")),
    responses(
        (status = 200, description = "Final statistics", body = BroadcastStats),
        (status = 404, description = "No such broadcast", body = ApiErrorBody),
    ),
)]
pub async fn end_broadcast(
    State(state): State<AppState>,
    Path(broadcast_id): Path<String>,
) -> Result<Json<BroadcastStats>, ApiError> {
    let stats = state.registry.end_broadcast(&broadcast_id, OPERATOR_END_REASON)?;
    Ok(Json(stats))
}

// ---------------------------------------------------------------------------
// GET /api/v1/broadcasts/:broadcast_id/stats
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/broadcasts/{broadcast_id}/stats",
    tag = "Broadcasts",
    params(("broadcast_id" = String, Path, description = "Broadcast ID")),
    responses(
        (status = 200, description = "Session statistics", body = BroadcastStats),
        (status = 404, description = "No such broadcast", body = ApiErrorBody),
    ),
)]
pub async fn broadcast_stats(
    State(state): State<AppState>,
    Path(broadcast_id): Path<String>,
) -> Result<Json<BroadcastStats>, ApiError> {
    Ok(Json(state.registry.stats(&broadcast_id)?))
}

// ---------------------------------------------------------------------------
// GET /api/v1/broadcasts/:broadcast_id/sources
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/broadcasts/{broadcast_id}/sources",
    tag = "Broadcasts",
    params(("broadcast_id" = String, Path, description = "Broadcast ID")),
    responses(
        (status = 200, description = "Current audio sources", body = Vec<AudioSource>),
        (status = 404, description = "No such broadcast", body = ApiErrorBody),
    ),
)]
pub async fn list_sources(
    State(state): State<AppState>,
    Path(broadcast_id): Path<String>,
) -> Result<Json<Vec<AudioSource>>, ApiError> {
    Ok(Json(state.registry.audio_sources(&broadcast_id)?))
}

// ---------------------------------------------------------------------------
// GET /api/v1/stats
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/stats",
    tag = "Server",
    responses(
        (status = 200, description = "Aggregate server statistics", body = ServerStats),
    ),
)]
pub async fn server_stats(State(state): State<AppState>) -> Json<ServerStats> {
    Json(state.registry.server_stats(state.connections.len()))
}
