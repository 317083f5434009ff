//! Remote store client: typed CRUD over the hosted table-style REST
//! endpoint.

pub mod filter;
pub mod rest;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::types::Record;

pub use filter::{Filter, FilterOp, SortDirection};
pub use rest::RestClient;

/// What a `remove` call deletes.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoveTarget {
    Id(String),
    Filter(Filter),
}

/// How `bulk_insert` treats rows that collide with an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Ask the remote to skip duplicates; they are reported, not failed.
    Ignore,
    /// A duplicate fails the whole batch with `RemoteError::Conflict`.
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkInsertReport {
    /// Rows the remote reports as stored.
    pub inserted: usize,
    /// Rows sent but not stored because they already existed.
    pub skipped: usize,
}

/// User-implemented (or `RestClient`) access to the authoritative store.
///
/// Implementations stamp ownership (`user_id`) on outgoing rows and map
/// transport failures onto `RemoteError` so callers can tell transient
/// failures, rejections, and expired authorization apart.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Update by id when `record` carries a remote id, insert otherwise.
    /// Returns the stored row (with the assigned `id` after an insert).
    async fn write(&self, collection: &str, record: &Record) -> Result<Record, RemoteError>;

    /// Ordered rows matching `filter`; empty (never absent) when none match.
    async fn read_filtered(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>, RemoteError>;

    async fn remove(&self, collection: &str, target: &RemoveTarget) -> Result<(), RemoteError>;

    /// Every row of `collection` visible to the current user.
    async fn read_all(&self, collection: &str) -> Result<Vec<Record>, RemoteError> {
        self.read_filtered(collection, &Filter::all()).await
    }

    /// Insert many rows at once. `records` must not carry ids.
    async fn bulk_insert(
        &self,
        collection: &str,
        records: &[Record],
        policy: ConflictPolicy,
    ) -> Result<BulkInsertReport, RemoteError>;
}
