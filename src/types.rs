use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of ids minted on the client before the remote assigns one.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Mint a fresh client-side id (`local-<uuid>`).
pub fn mint_local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Whether `id` was minted on the client and has never been seen by the remote.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

// ============================================================================
// Record
// ============================================================================

/// A schema-less row: field name → JSON value.
///
/// Two fields are reserved: `id` (assigned by the remote on first insert)
/// and `user_id` (stamped by the remote client, never trusted from callers).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap a JSON value. Returns `None` unless the value is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// The record id rendered as a string. Numeric ids (serial keys) are
    /// stringified; `null` counts as absent.
    pub fn id(&self) -> Option<String> {
        match self.0.get("id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn set_id(&mut self, id: impl Into<Value>) {
        self.0.insert("id".to_string(), id.into());
    }

    /// Id present and assigned by the remote (not locally minted).
    pub fn has_remote_id(&self) -> bool {
        self.id().is_some_and(|id| !is_local_id(&id))
    }

    pub fn user_id(&self) -> Option<&str> {
        self.0.get("user_id").and_then(Value::as_str)
    }

    pub fn set_user_id(&mut self, user_id: &str) {
        self.0
            .insert("user_id".to_string(), Value::String(user_id.to_string()));
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ============================================================================
// CacheKey
// ============================================================================

/// Key of a cached collection snapshot, optionally scoped (e.g. notes by
/// category).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub collection: String,
    pub scope: Option<String>,
}

impl CacheKey {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            scope: None,
        }
    }

    pub fn scoped(collection: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            scope: Some(scope.into()),
        }
    }

    /// Key used in the durable key-value store.
    pub fn storage_key(&self) -> String {
        format!("cache:{self}")
    }
}

impl From<&str> for CacheKey {
    fn from(collection: &str) -> Self {
        Self::new(collection)
    }
}

impl From<&CacheKey> for CacheKey {
    fn from(key: &CacheKey) -> Self {
        key.clone()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}", self.collection, scope),
            None => write!(f, "{}", self.collection),
        }
    }
}

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}
