//! Runtime configuration loaded from environment variables.
//!
//! Every knob has a compiled-in default; an unset or unparsable variable
//! falls back to it silently. `main` loads `.env` before calling
//! [`SyncConfig::from_env`].

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_HISTORY_SIZE: usize = 10_000;
const DEFAULT_COMPACTION_THRESHOLD: usize = 5_000;
const DEFAULT_MAX_UNDO_RATIO: f64 = 0.1;
const DEFAULT_MAX_POINTS_PER_EVENT: usize = 1_000;
const DEFAULT_BATCH_MAX_SIZE: usize = 50;
const DEFAULT_BATCH_INTERVAL_MS: u64 = 16;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 16;
const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;

/// Size limits for one room's history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryLimits {
    /// Hard cap on `events.len()` after compaction.
    pub max_history_size: usize,
    /// `events.len()` above which the compaction check runs.
    pub compaction_threshold: usize,
    /// Undo stack cap as a fraction of `max_history_size`.
    pub max_undo_ratio: f64,
}

impl HistoryLimits {
    /// `floor(max_history_size * max_undo_ratio)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn max_undo_size(&self) -> usize {
        let ratio = self.max_undo_ratio.clamp(0.0, 1.0);
        (self.max_history_size as f64 * ratio).floor() as usize
    }
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_history_size: DEFAULT_MAX_HISTORY_SIZE,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            max_undo_ratio: DEFAULT_MAX_UNDO_RATIO,
        }
    }
}

/// Cadence and size threshold for per-room broadcast batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Queue length that forces an immediate flush.
    pub max_size: usize,
    /// Delay between the first enqueue and the timer flush.
    pub interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_size: DEFAULT_BATCH_MAX_SIZE, interval: Duration::from_millis(DEFAULT_BATCH_INTERVAL_MS) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncConfig {
    pub port: u16,
    pub history: HistoryLimits,
    pub batch: BatchConfig,
    /// Cadence of the background driver that flushes every room's batch.
    pub flush_interval: Duration,
    /// Upper bound on `points.len()` for one drawing event.
    pub max_points_per_event: usize,
    /// Capacity of each connection's outbound frame queue.
    pub client_channel_capacity: usize,
}

impl SyncConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            history: HistoryLimits {
                max_history_size: env_parse("MAX_HISTORY_SIZE", DEFAULT_MAX_HISTORY_SIZE),
                compaction_threshold: env_parse("COMPACTION_THRESHOLD", DEFAULT_COMPACTION_THRESHOLD),
                max_undo_ratio: env_parse("MAX_UNDO_RATIO", DEFAULT_MAX_UNDO_RATIO),
            },
            batch: BatchConfig {
                max_size: env_parse("BATCH_MAX_SIZE", DEFAULT_BATCH_MAX_SIZE).max(1),
                interval: Duration::from_millis(env_parse("BATCH_INTERVAL_MS", DEFAULT_BATCH_INTERVAL_MS)),
            },
            flush_interval: Duration::from_millis(env_parse("FLUSH_INTERVAL_MS", DEFAULT_FLUSH_INTERVAL_MS).max(1)),
            max_points_per_event: env_parse("MAX_POINTS_PER_EVENT", DEFAULT_MAX_POINTS_PER_EVENT),
            client_channel_capacity: env_parse("CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY).max(1),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            history: HistoryLimits::default(),
            batch: BatchConfig::default(),
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            max_points_per_event: DEFAULT_MAX_POINTS_PER_EVENT,
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
