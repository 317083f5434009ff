//! Shared fixtures: an in-memory `RemoteStore` with failure injection and a
//! coordinator harness wired to it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Barrier;

use lifeos_sync::auth::StaticAuth;
use lifeos_sync::config::SyncConfig;
use lifeos_sync::error::RemoteError;
use lifeos_sync::remote::{BulkInsertReport, ConflictPolicy, Filter, RemoteStore, RemoveTarget};
use lifeos_sync::storage::MemoryStore;
use lifeos_sync::sync::{SyncCoordinator, SyncCoordinatorOptions, SyncEvent};
use lifeos_sync::types::{Record, User};

// ============================================================================
// MockRemote
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Write,
    Read,
    Remove,
    BulkInsert,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub op: Op,
    pub collection: String,
    /// Id sent with the call (writes and removes by id).
    pub id: Option<String>,
    /// Record sent with the call (writes), empty otherwise.
    pub record: Record,
}

type FailFn = dyn Fn(&Call) -> Option<RemoteError> + Send + Sync;

struct MockRemoteInner {
    tables: HashMap<String, Vec<Record>>,
    calls: Vec<Call>,
    next_id: i64,
    fail: Option<Box<FailFn>>,
    write_gate: Option<Arc<Barrier>>,
}

/// Authoritative store stand-in. Inserts get serial numeric ids starting
/// at 1; updates by id fail with 404 when the row does not exist.
pub struct MockRemote {
    inner: Mutex<MockRemoteInner>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockRemoteInner {
                tables: HashMap::new(),
                calls: Vec::new(),
                next_id: 0,
                fail: None,
                write_gate: None,
            }),
        }
    }

    /// Fail every call for which `f` returns an error.
    pub fn fail_when(&self, f: impl Fn(&Call) -> Option<RemoteError> + Send + Sync + 'static) {
        self.inner.lock().fail = Some(Box::new(f));
    }

    pub fn clear_failures(&self) {
        self.inner.lock().fail = None;
    }

    /// Hold every write until `barrier` releases.
    pub fn gate_writes(&self, barrier: Arc<Barrier>) {
        self.inner.lock().write_gate = Some(barrier);
    }

    pub fn seed(&self, collection: &str, rows: Vec<Value>) {
        let mut inner = self.inner.lock();
        let table = inner.tables.entry(collection.to_string()).or_default();
        for row in rows {
            table.push(Record::from_value(row).expect("seed rows must be objects"));
        }
    }

    pub fn rows(&self, collection: &str) -> Vec<Record> {
        self.inner
            .lock()
            .tables
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.inner.lock().calls.iter().filter(|c| c.op == op).count()
    }

    fn record_call(&self, call: Call) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock();
        inner.calls.push(call.clone());
        match &inner.fail {
            Some(f) => f(&call).map_or(Ok(()), Err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn write(&self, collection: &str, record: &Record) -> Result<Record, RemoteError> {
        let gate = self.inner.lock().write_gate.clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        self.record_call(Call {
            op: Op::Write,
            collection: collection.to_string(),
            id: record.id(),
            record: record.clone(),
        })?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let table = inner.tables.entry(collection.to_string()).or_default();
        if record.has_remote_id() {
            let id = record.id();
            match table.iter_mut().find(|r| r.id() == id) {
                Some(row) => {
                    *row = record.clone();
                    Ok(record.clone())
                }
                None => Err(RemoteError::Status {
                    status: 404,
                    body: "no row matched".to_string(),
                }),
            }
        } else {
            inner.next_id += 1;
            let mut row = record.clone();
            row.set_id(inner.next_id);
            table.push(row.clone());
            Ok(row)
        }
    }

    async fn read_filtered(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>, RemoteError> {
        self.record_call(Call {
            op: Op::Read,
            collection: collection.to_string(),
            id: None,
            record: Record::new(),
        })?;
        Ok(filter.apply(self.rows(collection)))
    }

    async fn remove(&self, collection: &str, target: &RemoveTarget) -> Result<(), RemoteError> {
        let id = match target {
            RemoveTarget::Id(id) => Some(id.clone()),
            RemoveTarget::Filter(_) => None,
        };
        self.record_call(Call {
            op: Op::Remove,
            collection: collection.to_string(),
            id,
            record: Record::new(),
        })?;
        let mut inner = self.inner.lock();
        if let Some(table) = inner.tables.get_mut(collection) {
            match target {
                RemoveTarget::Id(id) => table.retain(|r| r.id().as_deref() != Some(id.as_str())),
                RemoveTarget::Filter(filter) => table.retain(|r| !filter.matches(r)),
            }
        }
        Ok(())
    }

    async fn bulk_insert(
        &self,
        collection: &str,
        records: &[Record],
        _policy: ConflictPolicy,
    ) -> Result<BulkInsertReport, RemoteError> {
        self.record_call(Call {
            op: Op::BulkInsert,
            collection: collection.to_string(),
            id: None,
            record: Record::new(),
        })?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let table = inner.tables.entry(collection.to_string()).or_default();
        for record in records {
            inner.next_id += 1;
            let mut row = record.clone();
            row.set_id(inner.next_id);
            table.push(row);
        }
        Ok(BulkInsertReport {
            inserted: records.len(),
            skipped: 0,
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn test_config() -> SyncConfig {
    SyncConfig {
        request_timeout_ms: 1_000,
        max_attempts: 3,
        backoff_base_ms: 0,
        backoff_max_ms: 0,
        ..Default::default()
    }
}

pub fn network_error() -> RemoteError {
    RemoteError::Network("connection refused".to_string())
}

pub fn record(value: Value) -> Record {
    Record::from_value(value).expect("record must be an object")
}

pub fn title(r: &Record) -> Option<&str> {
    r.get("title").and_then(Value::as_str)
}

pub fn titled(t: &str) -> Record {
    record(json!({ "title": t }))
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub remote: Arc<MockRemote>,
    pub auth: Arc<StaticAuth>,
    pub coordinator: Arc<SyncCoordinator>,
    pub events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl Harness {
    /// Signed in as `u1`, online.
    pub fn new() -> Self {
        Self::with(test_config(), true)
    }

    pub fn offline() -> Self {
        Self::with(test_config(), false)
    }

    pub fn with(config: SyncConfig, online: bool) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::on_store(store, config, online)
    }

    /// Build on an existing store (simulates a restart).
    pub fn on_store(store: Arc<MemoryStore>, config: SyncConfig, online: bool) -> Self {
        let remote = Arc::new(MockRemote::new());
        let auth = Arc::new(StaticAuth::signed_in(User::new("u1"), "token-1"));
        let coordinator = Arc::new(
            SyncCoordinator::new(SyncCoordinatorOptions {
                store: store.clone(),
                remote: remote.clone(),
                auth: auth.clone(),
                config,
                online: Some(online),
            })
            .expect("coordinator opens"),
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        coordinator.subscribe(move |e| sink.lock().push(e.clone()));
        Self {
            store,
            remote,
            auth,
            coordinator,
            events,
        }
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    pub fn count_events(&self, pred: impl Fn(&SyncEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}
