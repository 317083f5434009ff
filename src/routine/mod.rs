pub mod migrate;
pub mod model;

pub use migrate::{
    migrate_legacy_day, migrated_marker_key, MigrationOutcome, RoutineMigrator, LEGACY_ROUTINE_KEY,
};
pub use model::{
    parse_date, LegacyPeriod, LegacyRoutineDay, Period, RoutineDay, RoutineTemplate,
    VersionedRoutineDay, CURRENT_SCHEMA_VERSION, ROUTINE_COLLECTION,
};
