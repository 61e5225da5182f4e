//! Event batcher — bounds broadcast frequency for stroke traffic.
//!
//! DESIGN
//! ======
//! Each room owns one batcher. Messages queue until either the queue reaches
//! `max_size` (flush now) or the batch timer fires. The batcher only decides;
//! the room directory spawns the timer task and delivers what `flush`
//! returns.
//!
//! Draining happens under the owning room's lock, so a timer flush and a
//! driver flush can race without delivering a message twice: whichever runs
//! second finds the queue empty.

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::BatchConfig;
use crate::state::ParticipantId;

/// One queued broadcast with its own exclusion target.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedMessage {
    pub event: String,
    pub payload: Value,
    pub exclude: Option<ParticipantId>,
}

/// What the caller must do after an enqueue.
#[derive(Debug, PartialEq)]
pub enum Enqueued {
    /// Size threshold reached: deliver this batch now.
    Flush(Vec<BatchedMessage>),
    /// First message of a new batch: arm the timer.
    ArmTimer,
    /// Timer already armed.
    Pending,
}

#[derive(Debug)]
pub struct EventBatcher {
    config: BatchConfig,
    queue: Vec<BatchedMessage>,
    timer: Option<JoinHandle<()>>,
}

impl EventBatcher {
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        Self { config, queue: Vec::new(), timer: None }
    }

    #[must_use]
    pub fn config(&self) -> BatchConfig {
        self.config
    }

    pub fn enqueue(&mut self, event: impl Into<String>, payload: Value, exclude: Option<ParticipantId>) -> Enqueued {
        self.queue.push(BatchedMessage { event: event.into(), payload, exclude });

        if self.queue.len() >= self.config.max_size {
            return Enqueued::Flush(self.flush());
        }
        if self.timer.is_some() {
            Enqueued::Pending
        } else {
            Enqueued::ArmTimer
        }
    }

    /// Record the timer task armed for the current batch.
    pub fn arm(&mut self, timer: JoinHandle<()>) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.abort();
        }
    }

    /// Cancel any pending timer and drain the queue in enqueue order.
    pub fn flush(&mut self) -> Vec<BatchedMessage> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        std::mem::take(&mut self.queue)
    }

    /// Drain from inside the timer task itself. Disarms without aborting,
    /// since the caller is the timer.
    pub fn flush_on_timer(&mut self) -> Vec<BatchedMessage> {
        self.timer = None;
        std::mem::take(&mut self.queue)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
impl EventBatcher {
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.timer.is_some()
    }
}

impl Drop for EventBatcher {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
#[path = "batcher_test.rs"]
mod tests;
