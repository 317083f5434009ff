//! Local cache: durable per-collection snapshots for instant reads and
//! offline fallback.
//!
//! Snapshots are stored as JSON arrays under `cache:<collection>[:<scope>]`.
//! There is no TTL and no invalidation: the last `put` for a key wins.
//! Reads never fail. Corrupt or unreadable snapshots are logged and
//! reported as "no data".

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::types::{CacheKey, Record};

use super::traits::{get_json, set_json, KeyValueStore};

pub struct LocalCache {
    store: Arc<dyn KeyValueStore>,
    /// Upper bound on records kept per key (`None` = unbounded).
    max_records: Option<usize>,
}

impl LocalCache {
    pub fn new(store: Arc<dyn KeyValueStore>, max_records: Option<usize>) -> Self {
        Self { store, max_records }
    }

    /// Last known snapshot for `key`, or `None` if nothing usable is cached.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<Record>> {
        let storage_key = key.storage_key();
        match get_json::<Vec<Record>>(self.store.as_ref(), &storage_key) {
            Ok(records) => records,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "discarding unreadable cache snapshot");
                None
            }
        }
    }

    /// Replace the snapshot for `key`.
    ///
    /// When a record bound is configured, only the first `max_records`
    /// entries are kept.
    pub fn put(&self, key: &CacheKey, mut records: Vec<Record>) -> Result<()> {
        if let Some(max) = self.max_records {
            if records.len() > max {
                records.truncate(max);
            }
        }
        set_json(self.store.as_ref(), &key.storage_key(), &records)
    }

    /// Merge `record` into the snapshot by `id`.
    ///
    /// The first cached record with the same id is replaced (later
    /// duplicates are left alone). Records with no match, or with no id at
    /// all, are prepended so the most recent write survives truncation.
    pub fn upsert(&self, key: &CacheKey, record: Record) -> Result<()> {
        let mut records = self.get(key).unwrap_or_default();
        let slot = record
            .id()
            .and_then(|id| records.iter().position(|r| r.id().as_deref() == Some(id.as_str())));
        match slot {
            Some(i) => records[i] = record,
            None => records.insert(0, record),
        }
        self.put(key, records)
    }

    /// Replace the record cached under `old_id` (typically a locally minted
    /// id) with `record`, which carries the remote-assigned id. Falls back to
    /// `upsert` when `old_id` is not cached.
    pub fn replace_id(&self, key: &CacheKey, old_id: &str, record: Record) -> Result<()> {
        if self.replace_existing(key, old_id, record.clone())? {
            return Ok(());
        }
        self.upsert(key, record)
    }

    /// Replace the first record cached under `id`. Never inserts; returns
    /// whether a record was replaced.
    pub fn replace_existing(&self, key: &CacheKey, id: &str, record: Record) -> Result<bool> {
        let Some(mut records) = self.get(key) else {
            return Ok(false);
        };
        let Some(i) = records.iter().position(|r| r.id().as_deref() == Some(id)) else {
            return Ok(false);
        };
        records[i] = record;
        self.put(key, records)?;
        Ok(true)
    }

    /// Drop every cached record with `id`. Returns whether anything was removed.
    pub fn remove(&self, key: &CacheKey, id: &str) -> Result<bool> {
        let Some(mut records) = self.get(key) else {
            return Ok(false);
        };
        let before = records.len();
        records.retain(|r| r.id().as_deref() != Some(id));
        if records.len() == before {
            return Ok(false);
        }
        self.put(key, records)?;
        Ok(true)
    }

    /// Forget the snapshot for `key`.
    pub fn clear(&self, key: &CacheKey) -> Result<()> {
        self.store.remove(&key.storage_key())
    }

    /// Every cache key that currently has a snapshot for `collection`
    /// (the unscoped key and all scoped ones).
    pub fn keys_for(&self, collection: &str) -> Vec<CacheKey> {
        let base = CacheKey::new(collection);
        let prefix = base.storage_key();
        let keys = match self.store.keys_with_prefix(&prefix) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(collection, error = %e, "failed to list cache keys");
                return Vec::new();
            }
        };
        keys.into_iter()
            .filter_map(|k| {
                let rest = &k[prefix.len()..];
                if rest.is_empty() {
                    Some(base.clone())
                } else {
                    rest.strip_prefix(':')
                        .map(|scope| CacheKey::scoped(collection, scope))
                }
            })
            .collect()
    }
}
