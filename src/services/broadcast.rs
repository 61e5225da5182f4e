//! Broadcast channel — named fan-out groups keyed by room id.
//!
//! ARCHITECTURE
//! ============
//! The room directory never talks to sockets. It subscribes participants to
//! a room's group and publishes frames to that group through the
//! [`BroadcastChannel`] capability. [`LocalBroadcast`] is the in-process
//! implementation: every websocket attaches its outbound queue on connect
//! and the channel pushes frames into those queues.
//!
//! Delivery is best-effort. A full or closed queue drops that frame for
//! that subscriber only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::state::ParticipantId;

#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    async fn subscribe(&self, room_id: &str, participant_id: ParticipantId);

    async fn unsubscribe(&self, room_id: &str, participant_id: ParticipantId);

    /// Deliver `frame` to every subscriber of `room_id` except `exclude`.
    /// Returns how many subscribers accepted it.
    async fn publish(&self, room_id: &str, frame: &Frame, exclude: Option<ParticipantId>) -> usize;
}

// =============================================================================
// LOCAL BROADCAST
// =============================================================================

#[derive(Clone, Default)]
pub struct LocalBroadcast {
    /// Outbound queue per connected participant.
    peers: Arc<RwLock<HashMap<ParticipantId, mpsc::Sender<Frame>>>>,
    /// Group membership per room id.
    groups: Arc<RwLock<HashMap<String, HashSet<ParticipantId>>>>,
}

impl LocalBroadcast {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound queue.
    pub async fn attach(&self, participant_id: ParticipantId, tx: mpsc::Sender<Frame>) {
        self.peers.write().await.insert(participant_id, tx);
    }

    /// Forget a connection's outbound queue and every group membership.
    pub async fn detach(&self, participant_id: ParticipantId) {
        self.peers.write().await.remove(&participant_id);
        let mut groups = self.groups.write().await;
        for members in groups.values_mut() {
            members.remove(&participant_id);
        }
        groups.retain(|_, members| !members.is_empty());
    }
}

#[cfg(test)]
impl LocalBroadcast {
    /// Number of subscribers in a group.
    pub(crate) async fn group_size(&self, room_id: &str) -> usize {
        self.groups.read().await.get(room_id).map_or(0, HashSet::len)
    }
}

#[async_trait]
impl BroadcastChannel for LocalBroadcast {
    async fn subscribe(&self, room_id: &str, participant_id: ParticipantId) {
        self.groups
            .write()
            .await
            .entry(room_id.to_string())
            .or_default()
            .insert(participant_id);
    }

    async fn unsubscribe(&self, room_id: &str, participant_id: ParticipantId) {
        let mut groups = self.groups.write().await;
        let Some(members) = groups.get_mut(room_id) else {
            return;
        };
        members.remove(&participant_id);
        if members.is_empty() {
            groups.remove(room_id);
        }
    }

    async fn publish(&self, room_id: &str, frame: &Frame, exclude: Option<ParticipantId>) -> usize {
        let groups = self.groups.read().await;
        let Some(members) = groups.get(room_id) else {
            return 0;
        };
        let peers = self.peers.read().await;

        let mut delivered = 0;
        for participant_id in members {
            if exclude == Some(*participant_id) {
                continue;
            }
            let Some(tx) = peers.get(participant_id) else {
                debug!(%room_id, %participant_id, "broadcast: subscriber has no attached queue");
                continue;
            };
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%room_id, %participant_id, event = %frame.event, "broadcast: queue full; dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(%room_id, %participant_id, "broadcast: queue closed");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
#[path = "broadcast_test.rs"]
mod tests;
