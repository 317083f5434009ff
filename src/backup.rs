//! Whole-account export and import against the remote store.
//!
//! Both bypass the local cache and queue: export reads every row the
//! signed-in user owns, import bulk-inserts rows under the importing user.
//! Export is all-or-nothing: a snapshot missing a collection is not a
//! backup. Import reports failures per collection, and one failing
//! collection does not stop the others.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RemoteError;
use crate::remote::{ConflictPolicy, RemoteStore};
use crate::types::{Record, User};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub exported_at: DateTime<Utc>,
    pub collections: BTreeMap<String, Vec<Record>>,
}

impl BackupSnapshot {
    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }
}

/// What to do with rows that already exist remotely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Leave existing rows alone and count the duplicates as skipped.
    #[default]
    Skip,
    /// Treat any duplicate as a failure of that collection's import.
    Fail,
}

impl From<DuplicatePolicy> for ConflictPolicy {
    fn from(policy: DuplicatePolicy) -> Self {
        match policy {
            DuplicatePolicy::Skip => ConflictPolicy::Ignore,
            DuplicatePolicy::Fail => ConflictPolicy::Fail,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionImport {
    pub inserted: usize,
    pub skipped: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub collections: BTreeMap<String, CollectionImport>,
}

impl ImportReport {
    pub fn inserted(&self) -> usize {
        self.collections.values().map(|c| c.inserted).sum()
    }

    pub fn skipped(&self) -> usize {
        self.collections.values().map(|c| c.skipped).sum()
    }

    /// Names of collections whose import failed.
    pub fn failed(&self) -> Vec<&str> {
        self.collections
            .iter()
            .filter(|(_, c)| c.error.is_some())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.collections.values().all(|c| c.error.is_none())
    }
}

/// Read every listed collection straight from the remote store. The first
/// collection that cannot be read fails the whole export.
pub async fn export(remote: &dyn RemoteStore, collections: &[&str]) -> Result<BackupSnapshot, RemoteError> {
    let mut out = BTreeMap::new();
    for collection in collections {
        let rows = remote.read_all(collection).await.map_err(|e| {
            warn!(collection = %collection, error = %e, "backup export aborted");
            e
        })?;
        out.insert(collection.to_string(), rows);
    }
    let snapshot = BackupSnapshot {
        exported_at: Utc::now(),
        collections: out,
    };
    info!(
        collections = snapshot.collections.len(),
        records = snapshot.record_count(),
        "backup exported"
    );
    Ok(snapshot)
}

/// Insert every row of `snapshot` as `user`. Source ids are dropped so the
/// remote assigns fresh ones; ownership is rewritten to the importing user.
pub async fn import(
    remote: &dyn RemoteStore,
    snapshot: &BackupSnapshot,
    user: &User,
    policy: DuplicatePolicy,
) -> ImportReport {
    let mut report = ImportReport::default();
    for (collection, rows) in &snapshot.collections {
        let records: Vec<Record> = rows.iter().map(|r| prepare(r, user)).collect();
        let result = match remote
            .bulk_insert(collection, &records, policy.into())
            .await
        {
            Ok(inserted) => CollectionImport {
                inserted: inserted.inserted,
                skipped: inserted.skipped,
                error: None,
            },
            Err(e) => {
                warn!(collection = %collection, error = %e, "collection import failed");
                let error = if matches!(e, RemoteError::Conflict { .. }) {
                    format!("duplicate rows rejected: {e}")
                } else {
                    e.to_string()
                };
                CollectionImport {
                    error: Some(error),
                    ..Default::default()
                }
            }
        };
        report.collections.insert(collection.clone(), result);
    }
    info!(
        inserted = report.inserted(),
        skipped = report.skipped(),
        failed = report.failed().len(),
        "backup imported"
    );
    report
}

fn prepare(record: &Record, user: &User) -> Record {
    let mut out = record.clone();
    out.remove("id");
    out.set_user_id(&user.id);
    out
}
