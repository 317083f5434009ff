//! SyncContext: the one place the sync engine is assembled.
//!
//! Built once at startup and passed to whatever needs it. It owns the only
//! `SyncCoordinator`, which in turn is the only writer of the cache and
//! queue.

use std::sync::Arc;

use crate::auth::AuthProvider;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::remote::{RemoteStore, RestClient};
use crate::routine::{RoutineMigrator, RoutineTemplate};
use crate::storage::{KeyValueStore, MemoryStore};
use crate::sync::{SyncCoordinator, SyncCoordinatorOptions, SyncScheduler};

pub struct SyncContext {
    config: SyncConfig,
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
    coordinator: Arc<SyncCoordinator>,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self> {
        let coordinator = Arc::new(SyncCoordinator::new(SyncCoordinatorOptions {
            store: store.clone(),
            remote: remote.clone(),
            auth: auth.clone(),
            config: config.clone(),
            online: None,
        })?);
        Ok(Self {
            config,
            store,
            remote,
            auth,
            coordinator,
        })
    }

    /// Validate `config`, open local storage (`storage_path`, or memory when
    /// unset) and talk to the configured REST endpoint.
    pub fn from_config(config: SyncConfig, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config)?;
        let remote: Arc<dyn RemoteStore> = Arc::new(RestClient::new(&config, auth.clone())?);
        Self::new(config, store, remote, auth)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    pub fn coordinator(&self) -> Arc<SyncCoordinator> {
        self.coordinator.clone()
    }

    pub fn migrator(&self) -> RoutineMigrator {
        self.migrator_with(RoutineTemplate::default())
    }

    pub fn migrator_with(&self, template: RoutineTemplate) -> RoutineMigrator {
        RoutineMigrator::new(self.coordinator.clone(), self.store.clone(), template)
    }

    /// Start the background drain loop. Must be called inside a tokio
    /// runtime; the loop stops when the returned scheduler is disposed or
    /// dropped.
    pub fn start_scheduler(&self) -> SyncScheduler {
        SyncScheduler::start(self.coordinator.clone(), self.config.drain_interval())
    }
}

#[cfg(feature = "sqlite")]
fn open_store(config: &SyncConfig) -> Result<Arc<dyn KeyValueStore>> {
    use crate::storage::SqliteStore;
    let store: Arc<dyn KeyValueStore> = match &config.storage_path {
        Some(path) => Arc::new(SqliteStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

#[cfg(not(feature = "sqlite"))]
fn open_store(config: &SyncConfig) -> Result<Arc<dyn KeyValueStore>> {
    if config.storage_path.is_some() {
        tracing::warn!("storage_path ignored: built without the sqlite feature");
    }
    Ok(Arc::new(MemoryStore::new()))
}
