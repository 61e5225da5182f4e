//! Room directory — room lifecycle, membership and per-room fan-out.
//!
//! DESIGN
//! ======
//! A room is created by the first join that asks for it and destroyed the
//! moment its last participant leaves; its history goes with it. Each
//! participant is in at most one room, tracked by the participant → room
//! index.
//!
//! LOCKING
//! =======
//! Every room sits behind its own `tokio::sync::Mutex`. The room map is held
//! only to look up, create or destroy a room, and always before a room lock,
//! never after. The participant index is never held across another lock.
//! A destroyed room is flagged `closed` so a handler still holding its handle
//! sees `NotInRoom` rather than mutating an orphan.
//!
//! DELIVERY
//! ========
//! `drawing-event` traffic is queued in the room's batcher. Everything else
//! is published immediately, and anything other than a cursor update first
//! flushes the pending batch so peers see strokes before the undo or clear
//! that refers to them. Because append and enqueue share the room lock,
//! delivery order within a room equals acceptance order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use crate::config::{BatchConfig, HistoryLimits};
use crate::frame::{Data, Frame, events, now_ms, to_data};
use crate::services::batcher::{BatchedMessage, Enqueued, EventBatcher};
use crate::services::broadcast::BroadcastChannel;
use crate::services::history::{HistoryStats, SessionHistory};
use crate::state::{CursorState, ParticipantId};

const MAX_ROOM_ID_LEN: usize = 50;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("invalid room id: {0:?}")]
    InvalidRoomId(String),
    #[error("room not found: {0}")]
    NotFound(String),
    #[error("not in a room")]
    NotInRoom,
}

impl crate::frame::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRoomId(_) => "INVALID_ROOM_ID",
            Self::NotFound(_) => "ROOM_NOT_FOUND",
            Self::NotInRoom => "NOT_IN_ROOM",
        }
    }
}

/// One collaborative session.
#[derive(Debug)]
pub struct Room {
    id: String,
    participants: HashSet<ParticipantId>,
    cursors: HashMap<ParticipantId, CursorState>,
    history: SessionHistory,
    batcher: EventBatcher,
    created_at: i64,
    closed: bool,
}

impl Room {
    fn new(id: &str, limits: HistoryLimits, batch: BatchConfig) -> Self {
        Self {
            id: id.to_string(),
            participants: HashSet::new(),
            cursors: HashMap::new(),
            history: SessionHistory::new(id, limits),
            batcher: EventBatcher::new(batch),
            created_at: now_ms(),
            closed: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Participant ids as strings, sorted for stable output.
    #[must_use]
    pub fn participant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.participants.iter().map(ToString::to_string).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn cursors(&self) -> Vec<CursorState> {
        let mut cursors: Vec<CursorState> = self.cursors.values().cloned().collect();
        cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        cursors
    }

    /// Overwrite a participant's live cursor.
    pub fn set_cursor(&mut self, participant_id: ParticipantId, cursor: CursorState) {
        self.cursors.insert(participant_id, cursor);
    }

    #[must_use]
    pub fn history(&self) -> &SessionHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut SessionHistory {
        &mut self.history
    }

    #[must_use]
    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.id.clone(),
            participant_count: self.participants.len(),
            event_count: self.history.len(),
            version: self.history.version(),
            created_at: self.created_at,
        }
    }

    #[must_use]
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.id.clone(),
            participants: self.participant_ids(),
            participant_count: self.participants.len(),
            created_at: self.created_at,
            history: self.history.stats(),
        }
    }
}

#[cfg(test)]
impl Room {
    pub(crate) fn pending_batch_len(&self) -> usize {
        self.batcher.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub participant_count: usize,
    pub event_count: usize,
    pub version: u64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: String,
    pub participants: Vec<String>,
    pub participant_count: usize,
    pub created_at: i64,
    pub history: HistoryStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryStats {
    pub total_rooms: usize,
    pub total_participants: usize,
    pub total_events: usize,
    pub rooms: Vec<RoomSummary>,
}

/// Result of leaving a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: String,
    pub remaining: usize,
    /// The participant was the last one; the room and its history are gone.
    pub destroyed: bool,
}

/// Result of joining a room. The room stays locked while the caller builds
/// the joiner's snapshot.
pub struct Joined {
    pub room: OwnedMutexGuard<Room>,
    /// The participant was already in this room; nothing changed.
    pub rejoined: bool,
}

/// Room ids are 1..=50 characters of ASCII alphanumerics, `-` or `_`.
///
/// # Errors
///
/// `InvalidRoomId` for anything else.
pub fn validate_room_id(room_id: &str) -> Result<(), RoomError> {
    let valid = !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid { Ok(()) } else { Err(RoomError::InvalidRoomId(room_id.to_string())) }
}

// =============================================================================
// DIRECTORY
// =============================================================================

#[derive(Clone)]
pub struct RoomDirectory {
    rooms: Arc<RwLock<HashMap<String, Arc<Mutex<Room>>>>>,
    members: Arc<RwLock<HashMap<ParticipantId, String>>>,
    channel: Arc<dyn BroadcastChannel>,
    limits: HistoryLimits,
    batch: BatchConfig,
}

impl RoomDirectory {
    #[must_use]
    pub fn new(channel: Arc<dyn BroadcastChannel>, limits: HistoryLimits, batch: BatchConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            members: Arc::new(RwLock::new(HashMap::new())),
            channel,
            limits,
            batch,
        }
    }

    /// Put `participant_id` into `room_id`, leaving any other room first.
    ///
    /// # Errors
    ///
    /// `InvalidRoomId` before anything else is touched; `NotFound` when the
    /// room does not exist and `create` is false.
    pub async fn join(&self, participant_id: ParticipantId, room_id: &str, create: bool) -> Result<Joined, RoomError> {
        validate_room_id(room_id)?;

        if self.room_of(participant_id).await.as_deref() == Some(room_id) {
            if let Some(room) = self.get(room_id).await {
                let guard = room.lock_owned().await;
                if !guard.closed && guard.participants.contains(&participant_id) {
                    return Ok(Joined { room: guard, rejoined: true });
                }
            }
        }

        if let Some(departure) = self.leave(participant_id).await {
            debug!(%participant_id, from = %departure.room_id, to = %room_id, "room: switched rooms");
        }

        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(room_id) {
            Some(room) => room.clone(),
            None if create => {
                let room = Arc::new(Mutex::new(Room::new(room_id, self.limits, self.batch)));
                rooms.insert(room_id.to_string(), room.clone());
                info!(%room_id, "room: created");
                room
            }
            None => return Err(RoomError::NotFound(room_id.to_string())),
        };
        let mut guard = room.lock_owned().await;
        drop(rooms);

        // Strokes accepted before the join go out now; the joiner gets them
        // through its snapshot instead.
        if !guard.batcher.is_empty() {
            let batch = guard.batcher.flush();
            self.deliver(room_id, batch).await;
        }
        guard.participants.insert(participant_id);
        self.members.write().await.insert(participant_id, room_id.to_string());
        self.channel.subscribe(room_id, participant_id).await;

        info!(%room_id, %participant_id, participants = guard.participants.len(), "room: joined");
        Ok(Joined { room: guard, rejoined: false })
    }

    /// Remove `participant_id` from its room. Idempotent.
    pub async fn leave(&self, participant_id: ParticipantId) -> Option<Departure> {
        let room_id = self.members.write().await.remove(&participant_id)?;
        self.channel.unsubscribe(&room_id, participant_id).await;

        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&room_id).cloned() else {
            return Some(Departure { room_id, remaining: 0, destroyed: true });
        };
        let mut guard = room.lock().await;
        guard.participants.remove(&participant_id);
        guard.cursors.remove(&participant_id);

        let remaining = guard.participants.len();
        let destroyed = remaining == 0;
        if destroyed {
            guard.closed = true;
            let discarded = guard.batcher.flush().len();
            rooms.remove(&room_id);
            info!(%room_id, events = guard.history.len(), discarded, "room: destroyed");
        }
        info!(%room_id, %participant_id, remaining, "room: left");
        Some(Departure { room_id, remaining, destroyed })
    }

    pub async fn room_of(&self, participant_id: ParticipantId) -> Option<String> {
        self.members.read().await.get(&participant_id).cloned()
    }

    /// Lock the room `participant_id` is currently in.
    ///
    /// # Errors
    ///
    /// `NotInRoom` when the participant has no room or the room closed while
    /// the lock was awaited.
    pub async fn member_room(&self, participant_id: ParticipantId) -> Result<OwnedMutexGuard<Room>, RoomError> {
        let room_id = self.room_of(participant_id).await.ok_or(RoomError::NotInRoom)?;
        let room = self
            .rooms
            .read()
            .await
            .get(&room_id)
            .cloned()
            .ok_or(RoomError::NotInRoom)?;
        let guard = room.lock_owned().await;
        if guard.closed || !guard.participants.contains(&participant_id) {
            return Err(RoomError::NotInRoom);
        }
        Ok(guard)
    }

    /// Fan `data` out to the room under `event`, skipping `exclude`.
    ///
    /// Drawing events are batched; the returned count covers only what was
    /// delivered by this call.
    pub async fn publish(&self, room: &mut Room, event: &str, data: Data, exclude: Option<ParticipantId>) -> usize {
        if event == events::DRAWING_EVENT {
            let payload = serde_json::Value::Object(data.into_iter().collect());
            return match room.batcher.enqueue(event, payload, exclude) {
                Enqueued::Flush(batch) => self.deliver(&room.id, batch).await,
                Enqueued::ArmTimer => {
                    self.arm_timer(room);
                    0
                }
                Enqueued::Pending => 0,
            };
        }

        let mut delivered = 0;
        if event != events::CURSOR_EVENT && !room.batcher.is_empty() {
            let batch = room.batcher.flush();
            delivered += self.deliver(&room.id, batch).await;
        }
        let frame = Frame::event(event, data).with_room_id(room.id.clone());
        delivered + self.channel.publish(&room.id, &frame, exclude).await
    }

    /// Publish to a room by id, taking its lock.
    ///
    /// # Errors
    ///
    /// `NotFound` when the room does not exist (or was just destroyed).
    pub async fn broadcast(
        &self,
        room_id: &str,
        event: &str,
        data: Data,
        exclude: Option<ParticipantId>,
    ) -> Result<usize, RoomError> {
        let room = self.get(room_id).await.ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
        let mut guard = room.lock().await;
        if guard.closed {
            return Err(RoomError::NotFound(room_id.to_string()));
        }
        Ok(self.publish(&mut guard, event, data, exclude).await)
    }

    /// Release every room's pending batch. Returns the number of messages
    /// delivered.
    pub async fn flush_all_batches(&self) -> usize {
        let rooms: Vec<Arc<Mutex<Room>>> = self.rooms.read().await.values().cloned().collect();

        let mut delivered = 0;
        for room in rooms {
            let mut guard = room.lock().await;
            if guard.closed || guard.batcher.is_empty() {
                continue;
            }
            let batch = guard.batcher.flush();
            delivered += self.deliver(&guard.id, batch).await;
        }
        delivered
    }

    /// Body of a room's batch timer task.
    async fn flush_room_on_timer(&self, room_id: &str) {
        let Some(room) = self.get(room_id).await else {
            return;
        };
        let mut guard = room.lock().await;
        if guard.closed {
            return;
        }
        let batch = guard.batcher.flush_on_timer();
        if !batch.is_empty() {
            self.deliver(room_id, batch).await;
        }
    }

    fn arm_timer(&self, room: &mut Room) {
        let directory = self.clone();
        let room_id = room.id.clone();
        let interval = room.batcher.config().interval;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            directory.flush_room_on_timer(&room_id).await;
        });
        room.batcher.arm(timer);
    }

    /// Deliver a drained batch in enqueue order, each message with its own
    /// exclusion target.
    async fn deliver(&self, room_id: &str, batch: Vec<BatchedMessage>) -> usize {
        let size = batch.len();
        let mut delivered = 0;
        for message in batch {
            let frame = Frame::event(message.event, to_data(&message.payload)).with_room_id(room_id);
            delivered += self.channel.publish(room_id, &frame, message.exclude).await;
        }
        debug!(%room_id, size, delivered, "room: batch flushed");
        delivered
    }

    async fn get(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Summaries of every live room, sorted by id.
    pub async fn list_rooms(&self) -> Vec<RoomSummary> {
        let rooms: Vec<Arc<Mutex<Room>>> = self.rooms.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let guard = room.lock().await;
            if !guard.closed {
                summaries.push(guard.summary());
            }
        }
        summaries.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        summaries
    }

    /// # Errors
    ///
    /// `InvalidRoomId` or `NotFound`.
    pub async fn room_info(&self, room_id: &str) -> Result<RoomInfo, RoomError> {
        validate_room_id(room_id)?;
        let room = self.get(room_id).await.ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
        let guard = room.lock().await;
        if guard.closed {
            return Err(RoomError::NotFound(room_id.to_string()));
        }
        Ok(guard.info())
    }

    #[cfg(test)]
    pub(crate) async fn exists(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn stats(&self) -> DirectoryStats {
        let rooms = self.list_rooms().await;
        DirectoryStats {
            total_rooms: rooms.len(),
            total_participants: rooms.iter().map(|r| r.participant_count).sum(),
            total_events: rooms.iter().map(|r| r.event_count).sum(),
            rooms,
        }
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
