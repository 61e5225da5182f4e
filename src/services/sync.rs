//! State synchronization — what a joining or resyncing client receives.
//!
//! A full sync carries the complete ordered history plus the room's live
//! canvas state. A client that reports the server's current version gets an
//! empty "partial" sync instead; there are no true deltas. A client reporting
//! any other version, including one ahead of the server, is resent
//! everything.
//!
//! The history is validated before it is shipped. A corrupt history yields
//! `SyncError::InvalidState` and the client is told `state-sync-failed`.

use serde::Serialize;
use tracing::warn;

use crate::frame::now_ms;
use crate::services::history::HistoryViolation;
use crate::services::room::Room;
use crate::state::{CursorState, DrawingEvent};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("room history is inconsistent ({} violations)", .0.len())]
    InvalidState(Vec<HistoryViolation>),
}

impl crate::frame::ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        "INVALID_ROOM_STATE"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasState {
    pub participants: Vec<String>,
    pub cursors: Vec<CursorState>,
    pub event_count: usize,
    pub undo_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSync {
    pub room_id: String,
    pub canvas_state: CanvasState,
    pub drawing_history: Vec<DrawingEvent>,
    pub version: u64,
    pub is_complete: bool,
    pub timestamp: i64,
}

fn canvas_state(room: &Room) -> CanvasState {
    CanvasState {
        participants: room.participant_ids(),
        cursors: room.cursors(),
        event_count: room.history().len(),
        undo_count: room.history().undo_len(),
    }
}

/// Complete snapshot of `room`.
///
/// # Errors
///
/// `InvalidState` when the history fails validation.
pub fn full_sync(room: &Room) -> Result<StateSync, SyncError> {
    let violations = room.history().validate();
    if !violations.is_empty() {
        warn!(room_id = %room.id(), violations = violations.len(), "sync: history failed validation");
        return Err(SyncError::InvalidState(violations));
    }
    let snapshot = room.history().snapshot();
    Ok(StateSync {
        room_id: snapshot.room_id,
        canvas_state: canvas_state(room),
        drawing_history: snapshot.events,
        version: snapshot.version,
        is_complete: true,
        timestamp: now_ms(),
    })
}

/// Answer a `request-state-sync`.
///
/// # Errors
///
/// `InvalidState` when a full sync is needed and the history is corrupt.
pub fn resync(room: &Room, client_version: Option<u64>) -> Result<StateSync, SyncError> {
    if client_version != Some(room.history().version()) {
        return full_sync(room);
    }
    Ok(StateSync {
        room_id: room.id().to_string(),
        canvas_state: canvas_state(room),
        drawing_history: Vec::new(),
        version: room.history().version(),
        is_complete: false,
        timestamp: now_ms(),
    })
}
