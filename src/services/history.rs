//! Session history — one room's ordered drawing log with undo/redo.
//!
//! DESIGN
//! ======
//! Events are kept sorted ascending by their client timestamp. Appends
//! binary-search the insertion point (rightmost among equal timestamps)
//! instead of re-sorting. Undo pops the chronological tail regardless of
//! author; redo re-inserts the most recently undone event at its sorted
//! position with its original timestamp.
//!
//! `version` moves by exactly one per mutation (append, undo, redo, clear).
//! Compaction bounds memory but never touches the version.
//!
//! Redo draws from the undo stack. The redo stack is only ever cleared, but
//! it is still part of snapshots and validation.
//!
//! Nothing here is async and nothing here locks; the owning room's mutex
//! serializes access.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use tracing::debug;

use crate::config::HistoryLimits;
use crate::frame::now_ms;
use crate::state::DrawingEvent;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HistoryError {
    /// The event was routed to the wrong room. Indicates an upstream bug.
    #[error("event room {actual} does not match history room {expected}")]
    RoomMismatch { expected: String, actual: String },
    #[error("duplicate event id: {0}")]
    DuplicateId(String),
}

impl crate::frame::ErrorCode for HistoryError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::RoomMismatch { .. } => "ROOM_MISMATCH",
            Self::DuplicateId(_) => "INVALID_DRAWING_EVENT",
        }
    }
}

/// One invariant broken by the current history contents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryViolation {
    #[error("event {id} at index {index} is older than its predecessor")]
    OutOfOrder { index: usize, id: String },
    #[error("event {id} belongs to room {room_id}")]
    ForeignRoom { id: String, room_id: String },
    #[error("event id {0} appears more than once")]
    DuplicateId(String),
}

/// Copy of the history returned to callers. Never a live reference.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySnapshot {
    pub room_id: String,
    pub events: Vec<DrawingEvent>,
    pub undo_stack: Vec<DrawingEvent>,
    pub redo_stack: Vec<DrawingEvent>,
    pub version: u64,
}

/// Result of one compaction pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionSnapshot {
    pub events: Vec<DrawingEvent>,
    pub version: u64,
    pub compacted_at: i64,
    pub size_before: usize,
    pub size_after: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub event_count: usize,
    pub undo_count: usize,
    pub redo_count: usize,
    pub version: u64,
    pub oldest_timestamp: Option<i64>,
    pub newest_timestamp: Option<i64>,
    /// Length of the events serialized as JSON.
    pub approx_bytes: usize,
}

#[derive(Debug)]
pub struct SessionHistory {
    room_id: String,
    limits: HistoryLimits,
    events: VecDeque<DrawingEvent>,
    undo_stack: VecDeque<DrawingEvent>,
    redo_stack: Vec<DrawingEvent>,
    /// Ids present in events, undo and redo.
    ids: HashSet<String>,
    version: u64,
}

// =============================================================================
// MUTATIONS
// =============================================================================

impl SessionHistory {
    #[must_use]
    pub fn new(room_id: impl Into<String>, limits: HistoryLimits) -> Self {
        Self {
            room_id: room_id.into(),
            limits,
            events: VecDeque::new(),
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            ids: HashSet::new(),
            version: 0,
        }
    }

    /// Insert an event at its timestamp position.
    ///
    /// Returns the compaction snapshot when the append triggered one.
    ///
    /// # Errors
    ///
    /// `RoomMismatch` if the event belongs to another room; `DuplicateId` if
    /// its id is already tracked. Neither mutates state.
    pub fn append(&mut self, event: DrawingEvent) -> Result<Option<CompactionSnapshot>, HistoryError> {
        if event.room_id != self.room_id {
            return Err(HistoryError::RoomMismatch { expected: self.room_id.clone(), actual: event.room_id });
        }
        if self.contains_id(&event.id) {
            return Err(HistoryError::DuplicateId(event.id));
        }

        for cleared in self.redo_stack.drain(..) {
            self.ids.remove(&cleared.id);
        }
        self.ids.insert(event.id.clone());
        self.insert_sorted(event);
        self.version += 1;

        Ok(self.maybe_compact())
    }

    /// Move the chronologically last event onto the undo stack. The stack is
    /// only bounded by compaction.
    pub fn undo(&mut self) -> Option<DrawingEvent> {
        let event = self.events.pop_back()?;
        self.undo_stack.push_back(event.clone());
        self.version += 1;
        Some(event)
    }

    /// Re-insert the most recently undone event.
    pub fn redo(&mut self) -> Option<DrawingEvent> {
        let event = self.undo_stack.pop_back()?;
        self.insert_sorted(event.clone());
        self.version += 1;
        Some(event)
    }

    /// Drop everything. Returns the number of events removed from the log.
    pub fn clear(&mut self) -> usize {
        let removed = self.events.len();
        self.events.clear();
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.ids.clear();
        self.version += 1;
        removed
    }

    /// Trim the log to `max_history` newest events and the undo stack to
    /// `floor(max_history * max_undo_ratio)` newest entries.
    pub fn compact(&mut self, max_history: usize, max_undo_ratio: f64) -> CompactionSnapshot {
        let limits = HistoryLimits { max_history_size: max_history, max_undo_ratio, ..self.limits };
        let size_before = self.events.len();

        let overflow = self.events.len().saturating_sub(max_history);
        for dropped in self.events.drain(..overflow) {
            self.ids.remove(&dropped.id);
        }
        let undo_overflow = self.trim_undo_stack(limits.max_undo_size());

        let size_after = self.events.len();
        debug!(
            room_id = %self.room_id,
            size_before,
            size_after,
            undo_dropped = undo_overflow,
            "history compacted"
        );

        CompactionSnapshot {
            events: self.events.iter().cloned().collect(),
            version: self.version,
            compacted_at: now_ms(),
            size_before,
            size_after,
        }
    }

    fn maybe_compact(&mut self) -> Option<CompactionSnapshot> {
        if self.events.len() <= self.limits.compaction_threshold {
            return None;
        }
        let over_cap = self.events.len() > self.limits.max_history_size;
        let undo_over_cap = self.undo_stack.len() > self.limits.max_undo_size();
        if !over_cap && !undo_over_cap {
            return None;
        }
        Some(self.compact(self.limits.max_history_size, self.limits.max_undo_ratio))
    }

    /// Drop the oldest undo entries beyond `cap`. Returns how many went.
    fn trim_undo_stack(&mut self, cap: usize) -> usize {
        let overflow = self.undo_stack.len().saturating_sub(cap);
        for dropped in self.undo_stack.drain(..overflow) {
            self.ids.remove(&dropped.id);
        }
        overflow
    }

    fn insert_sorted(&mut self, event: DrawingEvent) {
        let index = self.events.partition_point(|e| e.timestamp <= event.timestamp);
        self.events.insert(index, event);
    }
}

// =============================================================================
// READS
// =============================================================================

impl SessionHistory {
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    #[must_use]
    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Copy of the ordered event log.
    #[must_use]
    pub fn events(&self) -> Vec<DrawingEvent> {
        self.events.iter().cloned().collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            room_id: self.room_id.clone(),
            events: self.events(),
            undo_stack: self.undo_stack.iter().cloned().collect(),
            redo_stack: self.redo_stack.clone(),
            version: self.version,
        }
    }

    #[must_use]
    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            event_count: self.events.len(),
            undo_count: self.undo_stack.len(),
            redo_count: self.redo_stack.len(),
            version: self.version,
            oldest_timestamp: self.events.front().map(|e| e.timestamp),
            newest_timestamp: self.events.back().map(|e| e.timestamp),
            approx_bytes: serde_json::to_vec(&self.events).map_or(0, |bytes| bytes.len()),
        }
    }

    /// Check ordering, room ownership and id uniqueness. Empty means valid.
    #[must_use]
    pub fn validate(&self) -> Vec<HistoryViolation> {
        let mut violations = Vec::new();

        let successors = self.events.iter().skip(1);
        for (index, (prev, next)) in self.events.iter().zip(successors).enumerate() {
            if next.timestamp < prev.timestamp {
                violations.push(HistoryViolation::OutOfOrder { index: index + 1, id: next.id.clone() });
            }
        }

        let mut seen = HashSet::new();
        let all = self
            .events
            .iter()
            .chain(self.undo_stack.iter())
            .chain(self.redo_stack.iter());
        for event in all {
            if event.room_id != self.room_id {
                violations.push(HistoryViolation::ForeignRoom {
                    id: event.id.clone(),
                    room_id: event.room_id.clone(),
                });
            }
            if !seen.insert(event.id.as_str()) {
                violations.push(HistoryViolation::DuplicateId(event.id.clone()));
            }
        }

        violations
    }
}

#[cfg(test)]
impl SessionHistory {
    /// Push an event onto the log tail without any checks, to simulate
    /// corruption in tests.
    pub(crate) fn push_unchecked(&mut self, event: DrawingEvent) {
        self.events.push_back(event);
    }

    pub(crate) fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }
}

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;
