//! Sync-specific types: queue entries, replay outcomes, drain reports,
//! retry policy, and events.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::types::Record;

use super::state::ConnectivityState;

// ============================================================================
// Queue entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueAction {
    Save,
    Delete,
}

/// A mutation that could not reach the remote store yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub entry_id: String,
    pub collection: String,
    pub action: QueueAction,
    /// Full record for saves, `{ "id": … }` for deletes.
    pub payload: Record,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    /// Not replayed before this instant (backoff).
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// User that was signed in when the mutation was queued.
    #[serde(default)]
    pub owner: Option<String>,
}

impl QueueEntry {
    fn new(collection: &str, action: QueueAction, payload: Record, owner: Option<String>) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            collection: collection.to_string(),
            action,
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            owner,
        }
    }

    pub fn save(collection: &str, record: Record, owner: Option<String>) -> Self {
        Self::new(collection, QueueAction::Save, record, owner)
    }

    pub fn delete(collection: &str, id: &str, owner: Option<String>) -> Self {
        Self::new(
            collection,
            QueueAction::Delete,
            Record::new().with("id", id),
            owner,
        )
    }

    /// Id of the record this entry mutates.
    pub fn target_id(&self) -> Option<String> {
        self.payload.id()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// An entry removed from the live queue after exhausting its retry budget
/// or being rejected outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub entry: QueueEntry,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

// ============================================================================
// Replay
// ============================================================================

/// Verdict of replaying one queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Transient failure: back off and retry (counts toward the budget).
    Retry(String),
    /// Permanent failure: dead-letter immediately.
    Reject(String),
    /// Stop the drain; this and all later entries stay queued in order.
    Halt(String),
}

/// Result of one `drain` pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub applied: usize,
    /// Failed entries appended back to the queue.
    pub requeued: usize,
    /// Entries skipped because their backoff had not elapsed.
    pub deferred: usize,
    pub dead_lettered: Vec<DeadLetter>,
    /// The pass stopped early on a `Halt` outcome.
    pub halted: bool,
    /// Another drain was already running; nothing was done.
    pub skipped: bool,
}

impl DrainReport {
    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.applied == 0
            && self.requeued == 0
            && self.deferred == 0
            && self.dead_lettered.is_empty()
            && !self.halted
    }
}

// ============================================================================
// RetryPolicy
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed replays before an entry is dead-lettered (at least 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// No delay between retries.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the next replay after `attempts` failures:
    /// `base * 2^(attempts-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = (attempts - 1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// ============================================================================
// Coordinator results and events
// ============================================================================

/// What happened to a write from the caller's point of view. Every variant
/// is a success: queued writes are durable and will be replayed.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Applied remotely; carries the stored row (with its assigned id).
    Synced(Record),
    /// Delete applied remotely.
    Deleted,
    /// Cached and queued for replay.
    Queued,
    /// Only ever existed locally; nothing to propagate.
    LocalOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged {
        from: ConnectivityState,
        to: ConnectivityState,
    },
    /// The remote rejected the session; credentials were cleared.
    SessionExpired,
    DeadLettered(DeadLetter),
    Drained {
        applied: usize,
        requeued: usize,
        remaining: usize,
    },
}
