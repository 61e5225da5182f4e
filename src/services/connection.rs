//! Connection registry — who is connected, since when, and where.
//!
//! DESIGN
//! ======
//! Tracks participants independently of room membership. The room directory
//! owns membership; this registry only mirrors the last known room for
//! diagnostics and for disconnect cleanup. Counters feed the health endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::frame::now_ms;
use crate::state::ParticipantId;

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    /// Wall clock connect time, milliseconds since Unix epoch.
    pub connected_at: i64,
    /// Monotonic connect time, for session durations.
    pub connected_instant: Instant,
    pub current_room_id: Option<String>,
    pub messages_received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Connections accepted since startup.
    pub connections: u64,
    pub active_clients: usize,
    /// Mean age of the currently open sessions, in milliseconds.
    pub average_session_duration: u64,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    participants: Arc<RwLock<HashMap<ParticipantId, Participant>>>,
    total_connections: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, id: ParticipantId) -> Participant {
        let participant = Participant {
            id,
            connected_at: now_ms(),
            connected_instant: Instant::now(),
            current_room_id: None,
            messages_received: 0,
        };
        self.participants
            .write()
            .await
            .insert(id, participant.clone());
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        participant
    }

    /// Remove a participant. Returns how long the session lasted.
    pub async fn disconnect(&self, id: ParticipantId) -> Option<Duration> {
        let participant = self.participants.write().await.remove(&id)?;
        Some(participant.connected_instant.elapsed())
    }

    pub async fn set_room(&self, id: ParticipantId, room_id: Option<String>) {
        if let Some(participant) = self.participants.write().await.get_mut(&id) {
            participant.current_room_id = room_id;
        }
    }

    /// Count one inbound message.
    pub async fn touch(&self, id: ParticipantId) {
        if let Some(participant) = self.participants.write().await.get_mut(&id) {
            participant.messages_received += 1;
        }
    }

    #[cfg(test)]
    pub(crate) async fn get(&self, id: ParticipantId) -> Option<Participant> {
        self.participants.read().await.get(&id).cloned()
    }

    pub async fn stats(&self) -> ConnectionStats {
        let participants = self.participants.read().await;
        let active_clients = participants.len();
        let total_ms: u128 = participants
            .values()
            .map(|p| p.connected_instant.elapsed().as_millis())
            .sum();
        let average = if active_clients == 0 { 0 } else { total_ms / active_clients as u128 };

        ConnectionStats {
            connections: self.total_connections.load(Ordering::Relaxed),
            active_clients,
            average_session_duration: u64::try_from(average).unwrap_or(u64::MAX),
        }
    }
}
