//! SyncQueue: durable FIFO of mutations waiting for the remote store.
//!
//! Three lists are persisted through the key-value store:
//!   - `sync:queue`        live entries, in enqueue order
//!   - `sync:inflight`     the unvisited remainder of the drain in progress
//!   - `sync:dead_letters` entries that will not be retried automatically
//!
//! A drain moves the whole live queue into the in-flight list and walks it
//! front to back. The in-flight list always holds the entry being applied
//! plus everything after it, so a crash (or a cancelled drain future)
//! re-queues exactly the unapplied remainder, ahead of anything enqueued in
//! the meantime.
//!
//! A failing entry never blocks later ones: retries are appended to the
//! back of the live queue. Ordering relative to entries enqueued after the
//! drain started is not preserved.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::storage::traits::{get_json, set_json};
use crate::storage::KeyValueStore;

use super::types::{ApplyOutcome, DeadLetter, DrainReport, QueueEntry, RetryPolicy};

const QUEUE_KEY: &str = "sync:queue";
const INFLIGHT_KEY: &str = "sync:inflight";
const DEAD_LETTER_KEY: &str = "sync:dead_letters";

#[derive(Default)]
struct QueueState {
    live: VecDeque<QueueEntry>,
    inflight: Vec<QueueEntry>,
    dead: Vec<DeadLetter>,
}

pub struct SyncQueue {
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
    draining: AtomicBool,
}

impl SyncQueue {
    /// Load persisted state. An interrupted drain's in-flight entries are
    /// moved back to the front of the live queue.
    pub fn open(store: Arc<dyn KeyValueStore>, policy: RetryPolicy) -> Result<Self> {
        let mut live = VecDeque::from(load_list::<QueueEntry>(store.as_ref(), QUEUE_KEY));
        let inflight: Vec<QueueEntry> = load_list(store.as_ref(), INFLIGHT_KEY);
        let dead = load_list(store.as_ref(), DEAD_LETTER_KEY);

        let recovered = inflight.len();
        for entry in inflight.into_iter().rev() {
            live.push_front(entry);
        }

        let queue = Self {
            store,
            policy,
            state: Mutex::new(QueueState {
                live,
                inflight: Vec::new(),
                dead,
            }),
            draining: AtomicBool::new(false),
        };
        if recovered > 0 {
            info!(recovered, "re-queued entries from an interrupted drain");
            queue.persist(&queue.state.lock())?;
        }
        Ok(queue)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Append `entry` and persist before returning.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        let mut state = self.state.lock();
        debug!(
            collection = %entry.collection,
            action = ?entry.action,
            entry_id = %entry.entry_id,
            "enqueued"
        );
        state.live.push_back(entry);
        self.persist(&state)
    }

    /// Entries not yet applied: the in-flight remainder, then the live queue.
    pub fn pending(&self) -> Vec<QueueEntry> {
        let state = self.state.lock();
        state
            .inflight
            .iter()
            .chain(state.live.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.live.len() + state.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Dead letters
    // -----------------------------------------------------------------------

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead.clone()
    }

    /// Move every dead letter back to the end of the live queue with a
    /// fresh retry budget. Returns how many were moved.
    pub fn retry_dead_letters(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let revived: Vec<QueueEntry> = state
            .dead
            .drain(..)
            .map(|dl| {
                let mut entry = dl.entry;
                entry.attempts = 0;
                entry.next_attempt_at = None;
                entry.last_error = None;
                entry
            })
            .collect();
        let count = revived.len();
        state.live.extend(revived);
        if count > 0 {
            info!(count, "dead letters re-queued");
        }
        self.persist(&state)?;
        Ok(count)
    }

    /// Drop every dead letter. Returns how many were dropped.
    pub fn discard_dead_letters(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let count = state.dead.len();
        state.dead.clear();
        self.persist(&state)?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Replay every due entry through `apply`.
    ///
    /// Returns `DrainReport { skipped: true, .. }` without touching anything
    /// if another drain is already running.
    pub async fn drain<F, Fut>(&self, mut apply: F) -> DrainReport
    where
        F: FnMut(QueueEntry) -> Fut,
        Fut: Future<Output = ApplyOutcome>,
    {
        let Some(_guard) = DrainGuard::acquire(self) else {
            debug!("drain already in progress");
            return DrainReport::skipped();
        };

        let snapshot: Vec<QueueEntry> = {
            let mut state = self.state.lock();
            let snapshot: Vec<QueueEntry> = state.live.drain(..).collect();
            state.inflight = snapshot.clone();
            self.persist_logged(&state);
            snapshot
        };

        let mut report = DrainReport::default();
        for (i, entry) in snapshot.iter().enumerate() {
            let rest = &snapshot[i + 1..];
            let now = Utc::now();

            if !entry.is_due(now) {
                report.deferred += 1;
                self.settle(rest, Settled::Requeue(entry.clone()));
                continue;
            }

            match apply(entry.clone()).await {
                ApplyOutcome::Applied => {
                    report.applied += 1;
                    self.settle(rest, Settled::Done);
                }
                ApplyOutcome::Retry(reason) => {
                    let mut entry = entry.clone();
                    entry.attempts += 1;
                    entry.last_error = Some(reason.clone());
                    if entry.attempts >= self.policy.max_attempts {
                        warn!(
                            entry_id = %entry.entry_id,
                            attempts = entry.attempts,
                            %reason,
                            "retry budget exhausted, dead-lettering"
                        );
                        let dead = DeadLetter {
                            entry,
                            reason,
                            dead_at: now,
                        };
                        report.dead_lettered.push(dead.clone());
                        self.settle(rest, Settled::Dead(dead));
                    } else {
                        let delay = self.policy.backoff(entry.attempts);
                        entry.next_attempt_at = if delay.is_zero() {
                            None
                        } else {
                            let ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                            now.checked_add_signed(chrono::Duration::milliseconds(ms))
                        };
                        debug!(
                            entry_id = %entry.entry_id,
                            attempts = entry.attempts,
                            %reason,
                            "replay failed, requeued"
                        );
                        report.requeued += 1;
                        self.settle(rest, Settled::Requeue(entry));
                    }
                }
                ApplyOutcome::Reject(reason) => {
                    warn!(entry_id = %entry.entry_id, %reason, "replay rejected, dead-lettering");
                    let mut entry = entry.clone();
                    entry.last_error = Some(reason.clone());
                    let dead = DeadLetter {
                        entry,
                        reason,
                        dead_at: now,
                    };
                    report.dead_lettered.push(dead.clone());
                    self.settle(rest, Settled::Dead(dead));
                }
                ApplyOutcome::Halt(reason) => {
                    // The in-flight list still holds this entry and the rest;
                    // the guard moves them back to the front.
                    info!(%reason, remaining = rest.len() + 1, "drain halted");
                    report.halted = true;
                    break;
                }
            }
        }
        report
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    /// Record the fate of the entry just visited; `rest` becomes the new
    /// in-flight list.
    fn settle(&self, rest: &[QueueEntry], settled: Settled) {
        let mut state = self.state.lock();
        state.inflight = rest.to_vec();
        match settled {
            Settled::Done => {}
            Settled::Requeue(entry) => state.live.push_back(entry),
            Settled::Dead(dead) => state.dead.push(dead),
        }
        self.persist_logged(&state);
    }

    fn restore_inflight(&self) {
        let mut state = self.state.lock();
        if state.inflight.is_empty() {
            return;
        }
        let inflight = std::mem::take(&mut state.inflight);
        for entry in inflight.into_iter().rev() {
            state.live.push_front(entry);
        }
        self.persist_logged(&state);
    }

    fn persist(&self, state: &QueueState) -> Result<()> {
        set_json(self.store.as_ref(), QUEUE_KEY, &state.live)?;
        set_json(self.store.as_ref(), INFLIGHT_KEY, &state.inflight)?;
        set_json(self.store.as_ref(), DEAD_LETTER_KEY, &state.dead)
    }

    /// Drain bookkeeping cannot fail the drain; the in-memory state stays
    /// authoritative and the next successful persist catches up.
    fn persist_logged(&self, state: &QueueState) {
        if let Err(e) = self.persist(state) {
            error!(error = %e, "failed to persist sync queue");
        }
    }
}

enum Settled {
    Done,
    Requeue(QueueEntry),
    Dead(DeadLetter),
}

/// Holds the `draining` latch for one drain and puts back whatever is left
/// in flight when the drain ends, halts, or is cancelled.
struct DrainGuard<'a> {
    queue: &'a SyncQueue,
}

impl<'a> DrainGuard<'a> {
    fn acquire(queue: &'a SyncQueue) -> Option<Self> {
        queue
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { queue })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.queue.restore_inflight();
        self.queue.draining.store(false, Ordering::SeqCst);
    }
}

fn load_list<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Vec<T> {
    match get_json::<Vec<T>>(store, key) {
        Ok(list) => list.unwrap_or_default(),
        Err(e) => {
            warn!(key, error = %e, "discarding unreadable queue state");
            Vec::new()
        }
    }
}
