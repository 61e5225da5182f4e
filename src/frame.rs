//! Frame — the envelope every websocket message travels in.
//!
//! ARCHITECTURE
//! ============
//! Clients send frames named by `event` ("join-room", "drawing-event", ...).
//! The websocket layer dispatches on the event name and answers with frames
//! of its own event names ("room-joined", "state-sync", ...). Replies carry
//! `parent_id` so a client can correlate them with the request.
//!
//! DESIGN
//! ======
//! - Flat data: payload is always `Map<String, Value>`. Handlers decode it
//!   into typed payload structs with [`Frame::payload`].
//! - Inbound frames may omit `id`, `ts` and `data`; defaults fill them in.
//! - Errors are `error` frames with `{message, code}`. Clients branch on
//!   `code`, never on `message`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Frame data key for error messages.
pub const FRAME_MESSAGE: &str = "message";

/// Frame data key for grepable error codes.
pub const FRAME_CODE: &str = "code";

/// Frame data key for the server timestamp stamped on most replies.
pub const FRAME_TIMESTAMP: &str = "timestamp";

// =============================================================================
// EVENT NAMES
// =============================================================================

pub mod events {
    // Inbound.
    pub const JOIN_ROOM: &str = "join-room";
    pub const LEAVE_ROOM: &str = "leave-room";
    pub const DRAWING_EVENT: &str = "drawing-event";
    pub const CURSOR_EVENT: &str = "cursor-event";
    pub const UNDO_REQUEST: &str = "undo-request";
    pub const REDO_REQUEST: &str = "redo-request";
    pub const CLEAR_CANVAS: &str = "clear-canvas";
    pub const REQUEST_STATE_SYNC: &str = "request-state-sync";
    pub const REQUEST_ROOM_LIST: &str = "request-room-list";
    pub const REQUEST_ROOM_INFO: &str = "request-room-info";
    pub const PING: &str = "ping";

    // Outbound.
    pub const CONNECTED: &str = "connected";
    pub const ROOM_JOINED: &str = "room-joined";
    pub const ROOM_LEFT: &str = "room-left";
    pub const USER_JOINED: &str = "user-joined";
    pub const USER_LEFT: &str = "user-left";
    pub const STATE_SYNC: &str = "state-sync";
    pub const STATE_SYNC_FAILED: &str = "state-sync-failed";
    pub const UNDO_APPLIED: &str = "undo-applied";
    pub const UNDO_FAILED: &str = "undo-failed";
    pub const REDO_APPLIED: &str = "redo-applied";
    pub const REDO_FAILED: &str = "redo-failed";
    pub const CANVAS_CLEARED: &str = "canvas-cleared";
    pub const ROOM_LIST: &str = "room-list";
    pub const ROOM_INFO: &str = "room-info";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
}

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// The universal message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    #[serde(default)]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub event: String,
    #[serde(default)]
    pub data: Data,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable protocol error code for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

/// Serialize a typed payload into flat frame data. Non-object values yield
/// an empty map.
pub fn to_data<T: Serialize>(value: &T) -> Data {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => Data::new(),
    }
}

impl Frame {
    /// Create a frame for the named event. Entry point for every message.
    pub fn event(event: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            room_id: None,
            from: None,
            event: event.into(),
            data,
        }
    }

    /// Build a reply frame. Inherits `parent_id` and `room_id`.
    #[must_use]
    pub fn reply(&self, event: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            ts: now_ms(),
            room_id: self.room_id.clone(),
            from: None,
            event: event.into(),
            data,
        }
    }

    /// Reply carrying a serialized typed payload.
    #[must_use]
    pub fn reply_with<T: Serialize>(&self, event: impl Into<String>, payload: &T) -> Self {
        self.reply(event, to_data(payload))
    }

    /// Create an `error` reply from a code and message.
    #[must_use]
    pub fn error(&self, code: &str, message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert(FRAME_CODE.into(), serde_json::Value::String(code.to_string()));
        data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(message.into()));
        self.reply(events::ERROR, data)
    }

    /// Create a structured `error` reply from a typed error.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        self.error(err.error_code(), err.to_string())
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_room_id(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// DECODING
// =============================================================================

impl Frame {
    /// Decode `data` into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the data does not match `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let map: serde_json::Map<String, serde_json::Value> = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::from_value(serde_json::Value::Object(map))
    }

    /// String value of a data key, if present.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
