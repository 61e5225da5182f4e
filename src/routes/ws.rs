//! WebSocket handler — the synchronization protocol.
//!
//! DESIGN
//! ======
//! On upgrade, assigns a participant ID and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by event name
//! - Frames published to the participant's room → forward to client
//!
//! Handlers validate, mutate room state and return an `Outcome`. A handler
//! that changes a room hands back the still-locked room so the dispatch layer
//! publishes under the same lock that covered the mutation; that is what
//! keeps delivery order equal to acceptance order.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `connected` with the participant's `userId`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch applies Outcome (publish to room, reply to sender, or both)
//! 4. Close → leave room (`user-left` to peers) → detach → unregister

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, FRAME_CODE, FRAME_MESSAGE, FRAME_TIMESTAMP, Frame, events, now_ms, to_data};
use crate::services::room::{Departure, Joined, Room, RoomError, validate_room_id};
use crate::services::{cursor, drawing, sync};
use crate::state::{AppState, ParticipantId};

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what.
enum Outcome {
    /// Send these frames to the sender only.
    Reply(Vec<Frame>),
    /// Publish to the locked room, then send `reply` to the sender.
    Publish {
        room: OwnedMutexGuard<Room>,
        event: &'static str,
        data: Data,
        exclude: Option<ParticipantId>,
        reply: Vec<Frame>,
    },
}

#[derive(Debug, thiserror::Error)]
enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("invalid {event} payload: {reason}")]
    InvalidPayload { event: String, reason: String },
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("frame addressed to room {actual}, but participant is in {expected}")]
    RoomMismatch { expected: String, actual: String },
}

impl ErrorCode for ProtocolError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidFrame(_) | Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::UnknownEvent(_) => "UNKNOWN_EVENT",
            Self::RoomMismatch { .. } => "ROOM_MISMATCH",
        }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let participant_id = Uuid::new_v4();

    // Per-connection queue for frames published to the participant's room.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_channel_capacity);
    state.connections.connect(participant_id).await;
    state.channel.attach(participant_id, client_tx).await;

    let welcome = Frame::event(events::CONNECTED, Data::new())
        .with_data("userId", participant_id.to_string())
        .with_data(FRAME_TIMESTAMP, now_ms());

    if send_frame(&mut socket, &welcome).await.is_ok() {
        info!(%participant_id, "ws: client connected");

        loop {
            tokio::select! {
                msg = socket.recv() => {
                    let Some(Ok(msg)) = msg else { break };
                    match msg {
                        Message::Text(text) => {
                            let replies = process_inbound_text(&state, participant_id, text.as_str()).await;
                            for frame in replies {
                                let _ = send_frame(&mut socket, &frame).await;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                Some(frame) = client_rx.recv() => {
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    disconnect(&state, participant_id).await;
}

/// Tear down everything a connection owns. Safe to call for a participant
/// that never joined a room.
async fn disconnect(state: &AppState, participant_id: ParticipantId) {
    if let Some(departure) = state.rooms.leave(participant_id).await {
        announce_departure(state, participant_id, &departure).await;
    }
    state.channel.detach(participant_id).await;
    let session = state.connections.disconnect(participant_id).await;
    info!(%participant_id, session = ?session, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Kept apart from the socket so tests can drive the protocol directly.
async fn process_inbound_text(state: &AppState, participant_id: ParticipantId, text: &str) -> Vec<Frame> {
    state.connections.touch(participant_id).await;

    let req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%participant_id, error = %e, "ws: invalid inbound frame");
            return vec![error_frame(&ProtocolError::InvalidFrame(e.to_string()))];
        }
    };

    // Identity comes from the connection, never the client.
    let req = req.with_from(participant_id.to_string());

    match req.event.as_str() {
        events::CURSOR_EVENT => {}
        events::DRAWING_EVENT => debug!(%participant_id, id = %req.id, "ws: recv drawing-event"),
        _ => info!(%participant_id, id = %req.id, event = %req.event, "ws: recv frame"),
    }

    let result = match req.event.as_str() {
        events::JOIN_ROOM => handle_join(state, participant_id, &req).await,
        events::LEAVE_ROOM => handle_leave(state, participant_id, &req).await,
        events::DRAWING_EVENT => handle_drawing(state, participant_id, &req).await,
        events::CURSOR_EVENT => handle_cursor(state, participant_id, &req).await,
        events::UNDO_REQUEST => handle_undo(state, participant_id, &req).await,
        events::REDO_REQUEST => handle_redo(state, participant_id, &req).await,
        events::CLEAR_CANVAS => handle_clear(state, participant_id, &req).await,
        events::REQUEST_STATE_SYNC => handle_state_sync(state, participant_id, &req).await,
        events::REQUEST_ROOM_LIST => Ok(handle_room_list(state, &req).await),
        events::REQUEST_ROOM_INFO => handle_room_info(state, &req).await,
        events::PING => Ok(handle_ping(&req)),
        other => Err(req.error_from(&ProtocolError::UnknownEvent(other.to_string()))),
    };

    match result {
        Ok(Outcome::Reply(frames)) => frames,
        Ok(Outcome::Publish { mut room, event, data, exclude, reply }) => {
            state.rooms.publish(&mut room, event, data, exclude).await;
            reply
        }
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// MEMBERSHIP HANDLERS
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
    room_id: String,
    #[serde(default = "default_create")]
    create_if_not_exists: bool,
}

fn default_create() -> bool {
    true
}

async fn handle_join(state: &AppState, participant_id: ParticipantId, req: &Frame) -> Result<Outcome, Frame> {
    let body: JoinRequest = decode(req)?;
    validate_room_id(&body.room_id).map_err(|e| req.error_from(&e))?;

    // Leave explicitly so the old room hears about it before the new one
    // is locked.
    if state.rooms.room_of(participant_id).await.as_deref() != Some(body.room_id.as_str()) {
        if let Some(departure) = state.rooms.leave(participant_id).await {
            announce_departure(state, participant_id, &departure).await;
        }
    }

    let Joined { room, rejoined, .. } = state
        .rooms
        .join(participant_id, &body.room_id, body.create_if_not_exists)
        .await
        .map_err(|e| req.error_from(&e))?;
    state.connections.set_room(participant_id, Some(body.room_id.clone())).await;

    let client_count = room.participant_count();
    let joined = req
        .reply(events::ROOM_JOINED, Data::new())
        .with_room_id(room.id())
        .with_data("roomId", room.id())
        .with_data("clientCount", client_count)
        .with_data(FRAME_TIMESTAMP, now_ms());
    let snapshot = match sync::full_sync(&room) {
        Ok(snapshot) => req.reply_with(events::STATE_SYNC, &snapshot).with_room_id(room.id()),
        Err(e) => sync_failed(req, &e),
    };
    let reply = vec![joined, snapshot];

    if rejoined {
        return Ok(Outcome::Reply(reply));
    }
    let data = presence_data(participant_id, room.id(), client_count);
    Ok(Outcome::Publish { room, event: events::USER_JOINED, data, exclude: Some(participant_id), reply })
}

async fn handle_leave(state: &AppState, participant_id: ParticipantId, req: &Frame) -> Result<Outcome, Frame> {
    let Some(departure) = state.rooms.leave(participant_id).await else {
        return Err(req.error_from(&RoomError::NotInRoom));
    };
    announce_departure(state, participant_id, &departure).await;

    let left = req
        .reply(events::ROOM_LEFT, Data::new())
        .with_room_id(departure.room_id.clone())
        .with_data("roomId", departure.room_id)
        .with_data(FRAME_TIMESTAMP, now_ms());
    Ok(Outcome::Reply(vec![left]))
}

/// Tell the rest of a room that `participant_id` is gone.
async fn announce_departure(state: &AppState, participant_id: ParticipantId, departure: &Departure) {
    state.connections.set_room(participant_id, None).await;
    if departure.destroyed {
        return;
    }
    let data = presence_data(participant_id, &departure.room_id, departure.remaining);
    if let Err(e) = state
        .rooms
        .broadcast(&departure.room_id, events::USER_LEFT, data, Some(participant_id))
        .await
    {
        debug!(room_id = %departure.room_id, error = %e, "ws: user-left not delivered");
    }
}

// =============================================================================
// DRAWING HANDLERS
// =============================================================================

async fn handle_drawing(state: &AppState, participant_id: ParticipantId, req: &Frame) -> Result<Outcome, Frame> {
    let mut room = member_room(state, participant_id, req).await?;

    let event = drawing::parse_drawing_event(
        data_value(req),
        &participant_id.to_string(),
        room.id(),
        state.config.max_points_per_event,
        now_ms(),
    )
    .map_err(|e| req.error_from(&e))?;

    match room.history_mut().append(event.clone()) {
        Ok(Some(compaction)) => {
            info!(
                room_id = %room.id(),
                size_before = compaction.size_before,
                size_after = compaction.size_after,
                "ws: history compacted"
            );
        }
        Ok(None) => {}
        Err(e) => return Err(req.error_from(&e)),
    }

    Ok(Outcome::Publish {
        room,
        event: events::DRAWING_EVENT,
        data: to_data(&event),
        exclude: Some(participant_id),
        reply: Vec::new(),
    })
}

async fn handle_cursor(state: &AppState, participant_id: ParticipantId, req: &Frame) -> Result<Outcome, Frame> {
    let mut room = member_room(state, participant_id, req).await?;

    let cursor = cursor::parse_cursor(data_value(req), &participant_id.to_string(), room.id(), now_ms())
        .map_err(|e| req.error_from(&e))?;
    let data = to_data(&cursor);
    room.set_cursor(participant_id, cursor);

    Ok(Outcome::Publish { room, event: events::CURSOR_EVENT, data, exclude: Some(participant_id), reply: Vec::new() })
}

async fn handle_undo(state: &AppState, participant_id: ParticipantId, req: &Frame) -> Result<Outcome, Frame> {
    let mut room = member_room(state, participant_id, req).await?;

    let Some(undone) = room.history_mut().undo() else {
        return Ok(Outcome::Reply(vec![not_applicable(req, events::UNDO_FAILED, "nothing to undo")]));
    };
    let data = history_change(participant_id, &room, "undoneEvents", &[undone]);
    Ok(Outcome::Publish { room, event: events::UNDO_APPLIED, data, exclude: None, reply: Vec::new() })
}

async fn handle_redo(state: &AppState, participant_id: ParticipantId, req: &Frame) -> Result<Outcome, Frame> {
    let mut room = member_room(state, participant_id, req).await?;

    let Some(redone) = room.history_mut().redo() else {
        return Ok(Outcome::Reply(vec![not_applicable(req, events::REDO_FAILED, "nothing to redo")]));
    };
    let data = history_change(participant_id, &room, "redoneEvents", &[redone]);
    Ok(Outcome::Publish { room, event: events::REDO_APPLIED, data, exclude: None, reply: Vec::new() })
}

async fn handle_clear(state: &AppState, participant_id: ParticipantId, req: &Frame) -> Result<Outcome, Frame> {
    let mut room = member_room(state, participant_id, req).await?;

    let removed = room.history_mut().clear();
    info!(room_id = %room.id(), %participant_id, removed, "ws: canvas cleared");

    let mut data = Data::new();
    data.insert("userId".into(), json!(participant_id));
    data.insert("roomId".into(), json!(room.id()));
    data.insert("removedEvents".into(), json!(removed));
    data.insert("version".into(), json!(room.history().version()));
    data.insert(FRAME_TIMESTAMP.into(), json!(now_ms()));
    Ok(Outcome::Publish { room, event: events::CANVAS_CLEARED, data, exclude: None, reply: Vec::new() })
}

// =============================================================================
// SYNC AND INTROSPECTION HANDLERS
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateSyncRequest {
    #[serde(default)]
    client_version: Option<u64>,
}

async fn handle_state_sync(state: &AppState, participant_id: ParticipantId, req: &Frame) -> Result<Outcome, Frame> {
    let body: StateSyncRequest = decode(req)?;
    let room = member_room(state, participant_id, req).await?;

    let frame = match sync::resync(&room, body.client_version) {
        Ok(snapshot) => req.reply_with(events::STATE_SYNC, &snapshot).with_room_id(room.id()),
        Err(e) => sync_failed(req, &e),
    };
    Ok(Outcome::Reply(vec![frame]))
}

async fn handle_room_list(state: &AppState, req: &Frame) -> Outcome {
    let rooms = state.rooms.list_rooms().await;
    let mut data = Data::new();
    data.insert("rooms".into(), json!(rooms));
    data.insert(FRAME_TIMESTAMP.into(), json!(now_ms()));
    Outcome::Reply(vec![req.reply(events::ROOM_LIST, data)])
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomInfoRequest {
    room_id: String,
}

async fn handle_room_info(state: &AppState, req: &Frame) -> Result<Outcome, Frame> {
    let body: RoomInfoRequest = decode(req)?;
    let info = state.rooms.room_info(&body.room_id).await.map_err(|e| req.error_from(&e))?;
    Ok(Outcome::Reply(vec![req.reply_with(events::ROOM_INFO, &info)]))
}

fn handle_ping(req: &Frame) -> Outcome {
    let now = now_ms();
    let echoed = req.data.get(FRAME_TIMESTAMP).cloned().unwrap_or_else(|| json!(now));
    let pong = req
        .reply(events::PONG, Data::new())
        .with_data(FRAME_TIMESTAMP, echoed)
        .with_data("serverTimestamp", now);
    Outcome::Reply(vec![pong])
}

// =============================================================================
// HELPERS
// =============================================================================

/// Lock the sender's room, rejecting frames addressed to a different one.
async fn member_room(state: &AppState, participant_id: ParticipantId, req: &Frame) -> Result<OwnedMutexGuard<Room>, Frame> {
    let room = state
        .rooms
        .member_room(participant_id)
        .await
        .map_err(|e| req.error_from(&e))?;
    if let Some(addressed) = req.room_id.as_deref() {
        if addressed != room.id() {
            let err = ProtocolError::RoomMismatch { expected: room.id().to_string(), actual: addressed.to_string() };
            return Err(req.error_from(&err));
        }
    }
    Ok(room)
}

fn decode<T: DeserializeOwned>(req: &Frame) -> Result<T, Frame> {
    req.payload::<T>().map_err(|e| {
        req.error_from(&ProtocolError::InvalidPayload { event: req.event.clone(), reason: e.to_string() })
    })
}

fn data_value(req: &Frame) -> serde_json::Value {
    serde_json::Value::Object(req.data.clone().into_iter().collect())
}

fn presence_data(participant_id: ParticipantId, room_id: &str, client_count: usize) -> Data {
    let mut data = Data::new();
    data.insert("userId".into(), json!(participant_id));
    data.insert("roomId".into(), json!(room_id));
    data.insert("clientCount".into(), json!(client_count));
    data.insert(FRAME_TIMESTAMP.into(), json!(now_ms()));
    data
}

fn history_change(participant_id: ParticipantId, room: &Room, key: &str, changed: &[crate::state::DrawingEvent]) -> Data {
    let mut data = Data::new();
    data.insert(key.into(), json!(changed));
    data.insert("userId".into(), json!(participant_id));
    data.insert("roomId".into(), json!(room.id()));
    data.insert("version".into(), json!(room.history().version()));
    data.insert(FRAME_TIMESTAMP.into(), json!(now_ms()));
    data
}

/// `undo-failed` / `redo-failed` for the requester.
fn not_applicable(req: &Frame, event: &str, reason: &str) -> Frame {
    req.reply(event, Data::new())
        .with_data("reason", reason)
        .with_data(FRAME_TIMESTAMP, now_ms())
}

fn sync_failed(req: &Frame, err: &sync::SyncError) -> Frame {
    req.reply(events::STATE_SYNC_FAILED, Data::new())
        .with_data(FRAME_CODE, err.error_code())
        .with_data(FRAME_MESSAGE, err.to_string())
        .with_data(FRAME_TIMESTAMP, now_ms())
}

/// Error frame for input that never parsed into a request.
fn error_frame(err: &ProtocolError) -> Frame {
    Frame::event(events::ERROR, Data::new())
        .with_data(FRAME_CODE, err.error_code())
        .with_data(FRAME_MESSAGE, err.to_string())
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.event == events::ERROR || frame.event == events::STATE_SYNC_FAILED {
        let code = frame.data_str(FRAME_CODE).unwrap_or("-");
        let message = frame.data_str(FRAME_MESSAGE).unwrap_or("-");
        warn!(id = %frame.id, event = %frame.event, code, message, "ws: send error frame");
    } else if frame.event != events::CURSOR_EVENT {
        debug!(id = %frame.id, event = %frame.event, "ws: send frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
