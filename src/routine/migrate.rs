//! One-shot upgrade of legacy routine completion data to `RoutineDay`.
//!
//! Legacy data lives in a single JSON blob keyed by ISO date:
//! `{ "2024-05-01": { "morning": true, "evening": [true, false, …] } }`.
//! Only today's entry is migrated. The legacy blob is left untouched. A
//! durable `routine:migrated:<date>` marker, written once the upgraded day
//! is synced or queued, makes later runs a no-op no matter what happens to
//! the cache snapshots afterwards.

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::traits::{get_json, set_json};
use crate::storage::KeyValueStore;
use crate::sync::{QueueAction, SyncCoordinator, WriteOutcome};
use crate::types::Record;

use super::model::{
    LegacyPeriod, LegacyRoutineDay, Period, RoutineDay, RoutineTemplate, VersionedRoutineDay,
    ROUTINE_COLLECTION,
};

/// Key of the legacy `{ date: { morning, evening } }` blob.
pub const LEGACY_ROUTINE_KEY: &str = "routine:legacy_completions";

const MIGRATED_PREFIX: &str = "routine:migrated:";

/// Store key of the marker recording that `date` has been migrated.
pub fn migrated_marker_key(date: NaiveDate) -> String {
    format!("{MIGRATED_PREFIX}{date}")
}

#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    /// No legacy entry for the date.
    NothingToMigrate,
    /// A current-format record for the date already exists.
    AlreadyMigrated,
    Migrated {
        day: RoutineDay,
        write: WriteOutcome,
    },
    /// Legacy data exists but is in a shape that is not migrated.
    Skipped(String),
}

/// Upgrade one legacy day. `Whole(true)` marks every task of the period
/// done; `Positional` flags are zipped against the template's task order
/// and the longer side is truncated. Periods without usable data stay
/// not done.
pub fn migrate_legacy_day(
    legacy: &LegacyRoutineDay,
    date: NaiveDate,
    template: &RoutineTemplate,
) -> RoutineDay {
    let mut day = RoutineDay::new(date, template);
    for period in Period::ALL {
        let tasks = template.tasks(period);
        match legacy.period(period) {
            Some(LegacyPeriod::Whole(done)) => {
                for task in tasks {
                    day.set(period, task, *done);
                }
            }
            Some(LegacyPeriod::Positional(flags)) => {
                for (task, done) in tasks.iter().zip(flags) {
                    day.set(period, task, *done);
                }
            }
            None => {}
        }
    }
    day
}

pub struct RoutineMigrator {
    coordinator: Arc<SyncCoordinator>,
    store: Arc<dyn KeyValueStore>,
    template: RoutineTemplate,
}

impl RoutineMigrator {
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        store: Arc<dyn KeyValueStore>,
        template: RoutineTemplate,
    ) -> Self {
        Self {
            coordinator,
            store,
            template,
        }
    }

    pub fn template(&self) -> &RoutineTemplate {
        &self.template
    }

    /// Current-format record for `date`: a queued write first (it is the
    /// newest local state), then any cached snapshot of the collection.
    pub fn current_for(&self, date: NaiveDate) -> Option<RoutineDay> {
        let date_str = date.to_string();
        let for_date = |r: &Record| r.get("date").and_then(Value::as_str) == Some(date_str.as_str());

        let queued = self
            .coordinator
            .pending()
            .into_iter()
            .rev()
            .filter(|e| e.collection == ROUTINE_COLLECTION && e.action == QueueAction::Save)
            .find(|e| for_date(&e.payload))
            .and_then(|e| RoutineDay::from_record(&e.payload).ok());
        if queued.is_some() {
            return queued;
        }

        let cache = self.coordinator.cache();
        let cached = cache
            .keys_for(ROUTINE_COLLECTION)
            .iter()
            .filter_map(|key| cache.get(key))
            .flatten()
            .filter(|r| for_date(r))
            .find_map(|r| RoutineDay::from_record(&r).ok());
        cached
    }

    /// Whether `date` has already been migrated on this device.
    pub fn is_migrated(&self, date: NaiveDate) -> bool {
        match self.store.get(&migrated_marker_key(date)) {
            Ok(marker) => marker.is_some(),
            Err(e) => {
                warn!(%date, error = %e, "unreadable migration marker");
                false
            }
        }
    }

    fn mark_migrated(&self, date: NaiveDate) -> Result<()> {
        set_json(self.store.as_ref(), &migrated_marker_key(date), &true)
    }

    /// Migrate today's legacy entry, unless today was migrated before or a
    /// current-format record for today already exists. The result is written through the coordinator
    /// like any other record.
    pub async fn migrate_today(&self, today: NaiveDate) -> Result<MigrationOutcome> {
        if self.is_migrated(today) {
            debug!(%today, "routine day already migrated");
            return Ok(MigrationOutcome::AlreadyMigrated);
        }
        if self.current_for(today).is_some() {
            debug!(%today, "routine day already in current format");
            self.mark_migrated(today)?;
            return Ok(MigrationOutcome::AlreadyMigrated);
        }

        let blob = match get_json::<Value>(self.store.as_ref(), LEGACY_ROUTINE_KEY) {
            Ok(Some(blob)) => blob,
            Ok(None) => return Ok(MigrationOutcome::NothingToMigrate),
            Err(e) => {
                warn!(error = %e, "legacy routine data is unreadable");
                return Ok(MigrationOutcome::Skipped(e.to_string()));
            }
        };
        let Some(entry) = blob.get(today.to_string()) else {
            return Ok(MigrationOutcome::NothingToMigrate);
        };

        let day = match VersionedRoutineDay::decode(today, entry) {
            Ok(VersionedRoutineDay::Legacy(legacy)) if legacy.is_empty() => {
                return Ok(MigrationOutcome::Skipped(format!(
                    "no recognizable routine data for {today}"
                )));
            }
            Ok(VersionedRoutineDay::Legacy(legacy)) => {
                migrate_legacy_day(&legacy, today, &self.template)
            }
            Ok(VersionedRoutineDay::Current(mut day)) => {
                day.date = today;
                day
            }
            Err(e) => {
                warn!(%today, error = %e, "skipping legacy routine entry");
                return Ok(MigrationOutcome::Skipped(e.to_string()));
            }
        };

        let write = self
            .coordinator
            .write(ROUTINE_COLLECTION, day.to_record())
            .await?;
        self.mark_migrated(today)?;
        info!(%today, ?write, "migrated legacy routine day");
        Ok(MigrationOutcome::Migrated { day, write })
    }
}
