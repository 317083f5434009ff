//! SyncCoordinator: offline-tolerant read/write front door.
//!
//! Writes always land in the local cache first. When the client is online
//! and signed in they go straight to the remote store; otherwise (or when
//! the remote call fails) they are queued and replayed by `drain`. Reads
//! prefer the remote, refresh the cache snapshot, and fall back to the
//! cache when the remote cannot be reached.
//!
//! Locally minted ids (`local-…`) are mapped to the ids the remote assigns
//! on first insert. The map is persisted, so a queued update that still
//! carries the local id patches the inserted row instead of inserting a
//! second one.
//!
//! No lock is held across an `.await`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::auth::{AuthProvider, SessionLatch};
use crate::config::SyncConfig;
use crate::error::{FailureDisposition, RemoteError, Result};
use crate::remote::{Filter, RemoteStore, RemoveTarget};
use crate::storage::traits::{get_json, set_json};
use crate::storage::{KeyValueStore, LocalCache};
use crate::types::{is_local_id, mint_local_id, CacheKey, Record, User};

use super::events::{EventBus, SubscriptionId};
use super::queue::SyncQueue;
use super::state::{Connectivity, ConnectivityState, Signal, Transition};
use super::types::{
    ApplyOutcome, DeadLetter, DrainReport, QueueAction, QueueEntry, RetryPolicy, SyncEvent,
    WriteOutcome,
};

const ALIAS_KEY: &str = "sync:id_aliases";

pub struct SyncCoordinatorOptions {
    pub store: Arc<dyn KeyValueStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub config: SyncConfig,
    /// Network state at construction (default: online).
    pub online: Option<bool>,
}

pub struct SyncCoordinator {
    store: Arc<dyn KeyValueStore>,
    cache: LocalCache,
    queue: SyncQueue,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
    connectivity: Mutex<Connectivity>,
    session_latch: SessionLatch,
    /// Local id → remote id
    aliases: Mutex<HashMap<String, String>>,
    request_timeout: Duration,
    events: EventBus<SyncEvent>,
    wake: Notify,
}

impl SyncCoordinator {
    pub fn new(options: SyncCoordinatorOptions) -> Result<Self> {
        let SyncCoordinatorOptions {
            store,
            remote,
            auth,
            config,
            online,
        } = options;

        let queue = SyncQueue::open(store.clone(), RetryPolicy::from_config(&config))?;
        let aliases = match get_json::<HashMap<String, String>>(store.as_ref(), ALIAS_KEY) {
            Ok(map) => map.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "discarding unreadable id aliases");
                HashMap::new()
            }
        };
        let connectivity = Connectivity::new(online.unwrap_or(true), auth.current_user());

        Ok(Self {
            cache: LocalCache::new(store.clone(), config.max_cached_records),
            store,
            queue,
            remote,
            auth,
            connectivity: Mutex::new(connectivity),
            session_latch: SessionLatch::new(),
            aliases: Mutex::new(aliases),
            request_timeout: config.request_timeout(),
            events: EventBus::new(),
            wake: Notify::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectivityState {
        self.connectivity.lock().state()
    }

    pub fn current_user(&self) -> Option<User> {
        self.connectivity.lock().user().cloned()
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn pending(&self) -> Vec<QueueEntry> {
        self.queue.pending()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.dead_letters()
    }

    /// Give every dead letter a fresh retry budget and schedule a drain.
    pub fn retry_dead_letters(&self) -> Result<usize> {
        let count = self.queue.retry_dead_letters()?;
        if count > 0 {
            self.request_drain();
        }
        Ok(count)
    }

    pub fn discard_dead_letters(&self) -> Result<usize> {
        self.queue.discard_dead_letters()
    }

    /// The remote id a (possibly local) id resolves to.
    pub fn resolve_id(&self, id: &str) -> String {
        self.aliases
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    pub fn subscribe(&self, listener: impl Fn(&SyncEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    pub fn set_online(&self, online: bool) {
        self.signal(if online {
            Signal::Connected
        } else {
            Signal::Disconnected
        });
    }

    /// Record a fresh session. Re-arms session-expiry handling.
    pub fn login(&self, user: User) {
        self.session_latch.reset();
        self.signal(Signal::LoggedIn(user));
    }

    pub fn logout(&self) {
        self.signal(Signal::LoggedOut);
    }

    /// Ask the scheduler for a drain as soon as possible.
    pub fn request_drain(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn drain_requested(&self) {
        self.wake.notified().await;
    }

    fn signal(&self, signal: Signal) -> Transition {
        let transition = self.connectivity.lock().apply(signal);
        if transition.changed() {
            info!(from = %transition.from, to = %transition.to, "connectivity changed");
            self.events.emit(&SyncEvent::StateChanged {
                from: transition.from,
                to: transition.to,
            });
        }
        if transition.became_syncable() {
            self.request_drain();
        }
        transition
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Persist `record` locally and propagate it to the remote store now or
    /// later. `Err` only when local persistence fails.
    pub async fn write(&self, key: impl Into<CacheKey>, mut record: Record) -> Result<WriteOutcome> {
        let key = key.into();
        let id = match record.id() {
            Some(id) => {
                let resolved = self.resolve_id(&id);
                if resolved != id {
                    record.set_id(resolved.clone());
                }
                resolved
            }
            None => {
                let id = mint_local_id();
                record.set_id(id.clone());
                id
            }
        };

        // Captured before the remote call: an expired session clears the user.
        let owner = self.owner_id();
        self.cache.upsert(&key, record.clone())?;
        for other in self.cache.keys_for(&key.collection) {
            if other != key {
                self.cache.replace_existing(&other, &id, record.clone())?;
            }
        }

        // Earlier queued mutations of this record must reach the remote first.
        if !self.state().can_sync() || self.has_pending(&key.collection, &id) {
            self.queue
                .enqueue(QueueEntry::save(&key.collection, record, owner))?;
            return Ok(WriteOutcome::Queued);
        }

        match self.call(self.remote.write(&key.collection, &record)).await {
            Ok(stored) => {
                self.reconcile(&key.collection, &[id.as_str()], &stored);
                Ok(WriteOutcome::Synced(stored))
            }
            Err(e) => {
                warn!(collection = %key.collection, error = %e, "remote write failed, queued for replay");
                self.queue
                    .enqueue(QueueEntry::save(&key.collection, record, owner))?;
                Ok(WriteOutcome::Queued)
            }
        }
    }

    /// Remove record `id` locally and from the remote store now or later.
    pub async fn delete(&self, key: impl Into<CacheKey>, id: &str) -> Result<WriteOutcome> {
        let key = key.into();
        let resolved = self.resolve_id(id);

        let mut keys = self.cache.keys_for(&key.collection);
        if !keys.contains(&key) {
            keys.push(key.clone());
        }
        for k in &keys {
            self.cache.remove(k, &resolved)?;
            if resolved != id {
                self.cache.remove(k, id)?;
            }
        }

        let owner = self.owner_id();
        let pending = self.has_pending(&key.collection, &resolved);
        if is_local_id(&resolved) && !pending {
            debug!(collection = %key.collection, id = %resolved, "deleted record that never reached the remote");
            return Ok(WriteOutcome::LocalOnly);
        }

        if !self.state().can_sync() || pending {
            self.queue
                .enqueue(QueueEntry::delete(&key.collection, &resolved, owner))?;
            return Ok(WriteOutcome::Queued);
        }

        let target = RemoveTarget::Id(resolved.clone());
        match self.call(self.remote.remove(&key.collection, &target)).await {
            Ok(()) => Ok(WriteOutcome::Deleted),
            Err(e) => {
                warn!(collection = %key.collection, error = %e, "remote delete failed, queued for replay");
                self.queue
                    .enqueue(QueueEntry::delete(&key.collection, &resolved, owner))?;
                Ok(WriteOutcome::Queued)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Rows matching `filter`: from the remote when possible (refreshing
    /// the snapshot under `key`), else from the cache, else empty.
    pub async fn read(&self, key: impl Into<CacheKey>, filter: &Filter) -> Vec<Record> {
        let key = key.into();
        if self.state().can_sync() {
            match self
                .call(self.remote.read_filtered(&key.collection, filter))
                .await
            {
                Ok(rows) => {
                    let rows = self.overlay_pending(&key.collection, filter, rows);
                    if let Err(e) = self.cache.put(&key, rows.clone()) {
                        warn!(key = %key, error = %e, "failed to refresh cache snapshot");
                    }
                    return rows;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "remote read failed, serving cached snapshot");
                }
            }
        }
        self.read_cached(&key, filter)
    }

    /// Cached rows matching `filter`, without touching the network.
    pub fn read_cached(&self, key: &CacheKey, filter: &Filter) -> Vec<Record> {
        self.cache
            .get(key)
            .map(|rows| filter.apply(rows))
            .unwrap_or_default()
    }

    /// Apply queued-but-unsynced mutations on top of fresh remote rows so a
    /// refresh never hides the user's own offline edits.
    fn overlay_pending(&self, collection: &str, filter: &Filter, mut rows: Vec<Record>) -> Vec<Record> {
        for entry in self.queue.pending() {
            if entry.collection != collection {
                continue;
            }
            let Some(id) = entry.target_id().map(|id| self.resolve_id(&id)) else {
                continue;
            };
            let slot = rows.iter().position(|r| r.id().as_deref() == Some(id.as_str()));
            match (entry.action, slot) {
                (QueueAction::Save, Some(i)) if filter.matches(&entry.payload) => {
                    rows[i] = entry.payload;
                }
                (QueueAction::Save, None) if filter.matches(&entry.payload) => {
                    rows.insert(0, entry.payload);
                }
                (_, Some(i)) => {
                    rows.remove(i);
                }
                (_, None) => {}
            }
        }
        rows
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Replay queued mutations. A no-op unless online, signed in, and
    /// something is queued.
    pub async fn drain(&self) -> DrainReport {
        if !self.state().can_sync() || self.queue.is_empty() {
            return DrainReport::default();
        }
        let owner = self.owner_id();
        let this = self;
        let report = self
            .queue
            .drain(move |entry| this.replay(entry, owner.clone()))
            .await;

        for dead in &report.dead_lettered {
            self.events.emit(&SyncEvent::DeadLettered(dead.clone()));
        }
        if !report.skipped && !report.is_noop() {
            let remaining = self.queue.len();
            info!(
                applied = report.applied,
                requeued = report.requeued,
                dead_lettered = report.dead_lettered.len(),
                remaining,
                "drain finished"
            );
            self.events.emit(&SyncEvent::Drained {
                applied: report.applied,
                requeued: report.requeued,
                remaining,
            });
        }
        report
    }

    async fn replay(&self, entry: QueueEntry, owner: Option<String>) -> ApplyOutcome {
        if !self.state().can_sync() {
            return ApplyOutcome::Halt("not signed in".to_string());
        }
        if let Some(queued_by) = &entry.owner {
            if owner.as_deref() != Some(queued_by.as_str()) {
                return ApplyOutcome::Reject(format!(
                    "queued by user {queued_by}, not the current session"
                ));
            }
        }

        let collection = entry.collection.as_str();
        match entry.action {
            QueueAction::Save => {
                let mut record = entry.payload.clone();
                let sent_id = record.id();
                let resolved = sent_id.as_deref().map(|id| self.resolve_id(id));
                if let (Some(sent), Some(resolved)) = (&sent_id, &resolved) {
                    if sent != resolved {
                        record.set_id(resolved.clone());
                    }
                }
                match self.call(self.remote.write(collection, &record)).await {
                    Ok(stored) => {
                        let ids: Vec<&str> = sent_id
                            .iter()
                            .chain(resolved.iter())
                            .map(String::as_str)
                            .collect();
                        self.reconcile(collection, &ids, &stored);
                        ApplyOutcome::Applied
                    }
                    Err(e) => outcome_for(&e),
                }
            }
            QueueAction::Delete => {
                let Some(id) = entry.target_id() else {
                    return ApplyOutcome::Reject("delete entry has no id".to_string());
                };
                let id = self.resolve_id(&id);
                if is_local_id(&id) {
                    // The insert it would undo never happened.
                    return ApplyOutcome::Applied;
                }
                match self
                    .call(self.remote.remove(collection, &RemoveTarget::Id(id)))
                    .await
                {
                    Ok(()) => ApplyOutcome::Applied,
                    Err(e) => outcome_for(&e),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    /// Run a remote call under the request deadline. The first expired
    /// authorization seen by any call tears the session down, unless the
    /// call was issued by a session that has since been replaced.
    async fn call<T>(&self, fut: impl Future<Output = Result<T, RemoteError>>) -> Result<T, RemoteError> {
        let generation = self.session_latch.generation();
        let result = match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(
                u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        };
        if let Err(e) = &result {
            if e.is_auth_expired() {
                self.expire_session(generation);
            }
        }
        result
    }

    fn expire_session(&self, generation: u64) {
        if !self.session_latch.trip(generation) {
            debug!(generation, "session already expired or replaced");
            return;
        }
        warn!("authorization expired, clearing session");
        self.auth.clear_session();
        self.signal(Signal::SessionExpired);
        self.events.emit(&SyncEvent::SessionExpired);
    }

    /// Swap the cached copy of a just-stored record for the remote's row
    /// in every snapshot of `collection`, and remember id reassignments.
    fn reconcile(&self, collection: &str, sent_ids: &[&str], stored: &Record) {
        if let Some(remote_id) = stored.id() {
            for sent in sent_ids {
                if is_local_id(sent) && *sent != remote_id {
                    self.record_alias(sent, &remote_id);
                }
            }
        }
        for key in self.cache.keys_for(collection) {
            for id in sent_ids {
                match self.cache.replace_existing(&key, id, stored.clone()) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(key = %key, error = %e, "failed to reconcile cached record");
                        break;
                    }
                }
            }
        }
    }

    fn record_alias(&self, local_id: &str, remote_id: &str) {
        let mut aliases = self.aliases.lock();
        aliases.insert(local_id.to_string(), remote_id.to_string());
        debug!(local_id, remote_id, "recorded id alias");
        if let Err(e) = set_json(self.store.as_ref(), ALIAS_KEY, &*aliases) {
            warn!(error = %e, "failed to persist id aliases");
        }
    }

    fn has_pending(&self, collection: &str, id: &str) -> bool {
        self.queue.pending().iter().any(|entry| {
            entry.collection == collection
                && entry
                    .target_id()
                    .is_some_and(|t| t == id || self.resolve_id(&t) == id)
        })
    }

    fn owner_id(&self) -> Option<String> {
        self.connectivity.lock().user().map(|u| u.id.clone())
    }
}

fn outcome_for(e: &RemoteError) -> ApplyOutcome {
    match e.disposition() {
        FailureDisposition::Retry => ApplyOutcome::Retry(e.to_string()),
        FailureDisposition::Reject => ApplyOutcome::Reject(e.to_string()),
        FailureDisposition::Halt => ApplyOutcome::Halt(e.to_string()),
    }
}
