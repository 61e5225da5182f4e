//! Read-only REST mirror of the room directory, plus the health report.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;

use crate::frame::{ErrorCode, now_ms};
use crate::services::connection::ConnectionStats;
use crate::services::room::{DirectoryStats, RoomError, RoomInfo, RoomSummary};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: i64,
    #[serde(flatten)]
    pub connections: ConnectionStats,
    pub room_stats: DirectoryStats,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: &'static str,
}

/// `GET /health` — liveness plus connection and room counters.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: now_ms(),
        connections: state.connections.stats().await,
        room_stats: state.rooms.stats().await,
    })
}

/// `GET /api/rooms` — summaries of every live room.
pub async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    Json(state.rooms.list_rooms().await)
}

/// `GET /api/rooms/{id}` — one room's details.
pub async fn room_info(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomInfo>, (StatusCode, Json<ErrorBody>)> {
    state.rooms.room_info(&room_id).await.map(Json).map_err(room_error_response)
}

pub(crate) fn room_error_to_status(err: &RoomError) -> StatusCode {
    match err {
        RoomError::InvalidRoomId(_) => StatusCode::BAD_REQUEST,
        RoomError::NotFound(_) => StatusCode::NOT_FOUND,
        RoomError::NotInRoom => StatusCode::CONFLICT,
    }
}

fn room_error_response(err: RoomError) -> (StatusCode, Json<ErrorBody>) {
    let body = ErrorBody { message: err.to_string(), code: err.error_code() };
    (room_error_to_status(&err), Json(body))
}
