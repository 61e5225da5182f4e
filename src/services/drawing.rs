//! Drawing payload validation.
//!
//! A client sends a drawing event without the server-owned fields. This
//! module checks it and stamps `user_id`, `room_id` and `server_timestamp`
//! from the connection's identity, never from the payload.

use serde::Deserialize;

use crate::state::{DrawingEvent, Point, StrokePhase, Style};

const MAX_ID_LEN: usize = 64;
const MAX_COLOR_LEN: usize = 32;
const MAX_LINE_WIDTH: f64 = 100.0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DrawingError {
    #[error("malformed drawing event: {0}")]
    Malformed(String),
    #[error("event id must be 1..=64 characters")]
    InvalidId,
    #[error("stroke id must be 1..=64 characters")]
    InvalidStrokeId,
    #[error("drawing event has no points")]
    NoPoints,
    #[error("too many points: {count} > {max}")]
    TooManyPoints { count: usize, max: usize },
    #[error("point {0} has a non-finite coordinate")]
    NonFinitePoint(usize),
    #[error("style color must be 1..=32 characters")]
    InvalidColor,
    #[error("line width {0} outside (0, 100]")]
    LineWidthOutOfRange(f64),
    #[error("timestamp must be positive, got {0}")]
    NonPositiveTimestamp(i64),
}

impl crate::frame::ErrorCode for DrawingError {
    fn error_code(&self) -> &'static str {
        "INVALID_DRAWING_EVENT"
    }
}

/// Client-supplied part of a drawing event. Unknown fields, including any
/// client-provided `userId`/`roomId`/`serverTimestamp`, are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingPayload {
    pub id: String,
    pub stroke_id: String,
    #[serde(rename = "type")]
    pub phase: StrokePhase,
    pub points: Vec<Point>,
    pub style: Style,
    pub timestamp: i64,
}

impl DrawingPayload {
    /// Validate and stamp server-owned fields.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule; nothing is partially accepted.
    pub fn into_event(
        self,
        user_id: &str,
        room_id: &str,
        max_points: usize,
        server_timestamp: i64,
    ) -> Result<DrawingEvent, DrawingError> {
        if self.id.is_empty() || self.id.len() > MAX_ID_LEN {
            return Err(DrawingError::InvalidId);
        }
        if self.stroke_id.is_empty() || self.stroke_id.len() > MAX_ID_LEN {
            return Err(DrawingError::InvalidStrokeId);
        }
        if self.points.is_empty() {
            return Err(DrawingError::NoPoints);
        }
        if self.points.len() > max_points {
            return Err(DrawingError::TooManyPoints { count: self.points.len(), max: max_points });
        }
        if let Some(index) = self.points.iter().position(|p| !p.is_finite()) {
            return Err(DrawingError::NonFinitePoint(index));
        }
        validate_style(&self.style)?;
        if self.timestamp <= 0 {
            return Err(DrawingError::NonPositiveTimestamp(self.timestamp));
        }

        Ok(DrawingEvent {
            id: self.id,
            stroke_id: self.stroke_id,
            phase: self.phase,
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            points: self.points,
            style: self.style,
            timestamp: self.timestamp,
            server_timestamp,
        })
    }
}

fn validate_style(style: &Style) -> Result<(), DrawingError> {
    if style.color.trim().is_empty() || style.color.len() > MAX_COLOR_LEN {
        return Err(DrawingError::InvalidColor);
    }
    let width = style.line_width;
    if !width.is_finite() || width <= 0.0 || width > MAX_LINE_WIDTH {
        return Err(DrawingError::LineWidthOutOfRange(width));
    }
    Ok(())
}

/// Decode and validate a raw frame payload in one step.
///
/// # Errors
///
/// `Malformed` when the JSON shape is wrong, otherwise any rule violation.
pub fn parse_drawing_event(
    raw: serde_json::Value,
    user_id: &str,
    room_id: &str,
    max_points: usize,
    server_timestamp: i64,
) -> Result<DrawingEvent, DrawingError> {
    let payload: DrawingPayload = serde_json::from_value(raw).map_err(|e| DrawingError::Malformed(e.to_string()))?;
    payload.into_event(user_id, room_id, max_points, server_timestamp)
}

#[cfg(test)]
#[path = "drawing_test.rs"]
mod tests;
