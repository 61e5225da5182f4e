//! Cursor service — ephemeral pointer positions.
//!
//! DESIGN
//! ======
//! Cursor positions are overwritten in place in the room's cursor map and
//! broadcast to peers unbatched. They never enter the history and are
//! dropped when the participant leaves.

use serde::Deserialize;

use crate::state::{CursorState, Point};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CursorError {
    #[error("malformed cursor event: {0}")]
    Malformed(String),
    #[error("cursor position has a non-finite coordinate")]
    NonFinite,
}

impl crate::frame::ErrorCode for CursorError {
    fn error_code(&self) -> &'static str {
        "INVALID_CURSOR_EVENT"
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorPayload {
    position: Point,
    #[serde(default = "default_active")]
    is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Decode a cursor payload into the participant's new cursor state.
///
/// # Errors
///
/// `Malformed` on a bad shape, `NonFinite` on NaN/infinite coordinates.
pub fn parse_cursor(raw: serde_json::Value, user_id: &str, room_id: &str, now: i64) -> Result<CursorState, CursorError> {
    let payload: CursorPayload = serde_json::from_value(raw).map_err(|e| CursorError::Malformed(e.to_string()))?;
    if !payload.position.is_finite() {
        return Err(CursorError::NonFinite);
    }
    let mut position = payload.position;
    if position.timestamp <= 0 {
        position.timestamp = now;
    }
    Ok(CursorState {
        user_id: user_id.to_string(),
        room_id: room_id.to_string(),
        position,
        is_active: payload.is_active,
        timestamp: now,
    })
}
