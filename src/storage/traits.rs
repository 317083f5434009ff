/// Durable key-value storage traits for lifeos-sync.
///
/// `KeyValueStore` is the narrow string-in/string-out trait implemented by
/// concrete backends (in-memory, SQLite). The local cache, the sync
/// queue and the routine migrator all store JSON text through it.
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Result, StorageError};

/// Synchronous durable key-value storage.
///
/// Implementors must be `Send + Sync` so they can be shared across threads.
/// Capacity is bounded by the platform; callers must not assume unlimited
/// size.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace the value under `key`.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, sorted ascending.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read and deserialize the JSON stored under `key`.
///
/// Returns `Err(StorageError::Corruption)` when the stored text does not
/// parse as `T`; callers that must never fail on corrupt data log and treat
/// that as "no data".
pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| {
            StorageError::Corruption {
                key: key.to_string(),
                source,
            }
            .into()
        })
}

/// Serialize `value` as JSON and store it under `key`.
pub fn set_json<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value).map_err(|source| StorageError::Serialize {
        key: key.to_string(),
        source,
    })?;
    store.set(key, &raw)
}
