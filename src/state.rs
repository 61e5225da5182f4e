//! Shared application state and the drawing data model.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the room directory, the connection registry and the local
//! broadcast channel. Each room owns its own history, cursor map and
//! pending batch behind a per-room lock; see `services::room`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::services::broadcast::LocalBroadcast;
use crate::services::connection::ConnectionRegistry;
use crate::services::room::RoomDirectory;

/// Server-assigned identity of one websocket connection.
pub type ParticipantId = Uuid;

// =============================================================================
// DRAWING MODEL
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub timestamp: i64,
}

impl Point {
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineCap {
    Round,
    Square,
    Butt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineJoin {
    Round,
    Bevel,
    Miter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Style {
    pub color: String,
    pub line_width: f64,
    pub line_cap: LineCap,
    pub line_join: LineJoin,
    #[serde(default)]
    pub is_eraser: bool,
}

/// Position of an event inside its stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrokePhase {
    Start,
    Line,
    End,
}

/// One accepted drawing operation. Immutable once appended to a history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingEvent {
    pub id: String,
    pub stroke_id: String,
    #[serde(rename = "type")]
    pub phase: StrokePhase,
    pub user_id: String,
    pub room_id: String,
    pub points: Vec<Point>,
    pub style: Style,
    /// Client clock; the history is ordered by this value.
    pub timestamp: i64,
    pub server_timestamp: i64,
}

/// Live pointer position of one participant. Never part of the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    pub user_id: String,
    pub room_id: String,
    pub position: Point,
    pub is_active: bool,
    pub timestamp: i64,
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub rooms: RoomDirectory,
    pub connections: ConnectionRegistry,
    /// Concrete channel so connections can attach their outbound queues.
    pub channel: Arc<LocalBroadcast>,
    pub config: Arc<SyncConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        let channel = Arc::new(LocalBroadcast::new());
        let rooms = RoomDirectory::new(channel.clone(), config.history, config.batch);
        Self { rooms, connections: ConnectionRegistry::new(), channel, config: Arc::new(config) }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
