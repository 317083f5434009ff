//! Routine completion records.
//!
//! A `RoutineDay` stores one boolean per task for each period. Task keys are
//! fixed by a `RoutineTemplate`. Stored records carry `schemaVersion`:
//! absent or `1` is the legacy whole-period shape, `2` is the per-task map.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::RoutineError;
use crate::types::Record;

pub const ROUTINE_COLLECTION: &str = "routine_completions";
pub const CURRENT_SCHEMA_VERSION: u64 = 2;
pub const LEGACY_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Morning,
    Evening,
}

impl Period {
    pub const ALL: [Period; 2] = [Period::Morning, Period::Evening];

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Morning => "morning",
            Period::Evening => "evening",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RoutineTemplate
// ============================================================================

/// Ordered task keys per period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineTemplate {
    pub morning: Vec<String>,
    pub evening: Vec<String>,
}

impl Default for RoutineTemplate {
    fn default() -> Self {
        Self::new(
            ["wake_early", "hydrate", "exercise", "plan_day"],
            ["review_day", "tidy_up", "read", "sleep_on_time"],
        )
    }
}

impl RoutineTemplate {
    pub fn new<M, E>(morning: M, evening: E) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            morning: morning.into_iter().map(Into::into).collect(),
            evening: evening.into_iter().map(Into::into).collect(),
        }
    }

    pub fn tasks(&self, period: Period) -> &[String] {
        match period {
            Period::Morning => &self.morning,
            Period::Evening => &self.evening,
        }
    }
}

// ============================================================================
// RoutineDay (schema version 2)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineDay {
    pub schema_version: u64,
    pub date: NaiveDate,
    #[serde(default)]
    pub morning: BTreeMap<String, bool>,
    #[serde(default)]
    pub evening: BTreeMap<String, bool>,
}

impl RoutineDay {
    /// Every template task present and not done.
    pub fn new(date: NaiveDate, template: &RoutineTemplate) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            date,
            morning: blank(&template.morning),
            evening: blank(&template.evening),
        }
    }

    pub fn tasks(&self, period: Period) -> &BTreeMap<String, bool> {
        match period {
            Period::Morning => &self.morning,
            Period::Evening => &self.evening,
        }
    }

    fn tasks_mut(&mut self, period: Period) -> &mut BTreeMap<String, bool> {
        match period {
            Period::Morning => &mut self.morning,
            Period::Evening => &mut self.evening,
        }
    }

    /// Mark `task` done or not done. Unknown tasks are ignored; returns
    /// whether the task exists.
    pub fn set(&mut self, period: Period, task: &str, done: bool) -> bool {
        match self.tasks_mut(period).get_mut(task) {
            Some(slot) => {
                *slot = done;
                true
            }
            None => false,
        }
    }

    pub fn is_done(&self, period: Period, task: &str) -> bool {
        self.tasks(period).get(task).copied().unwrap_or(false)
    }

    /// Every task in the period is done. A period with no tasks is not
    /// complete, so an empty template never feeds a streak.
    pub fn is_complete(&self, period: Period) -> bool {
        let tasks = self.tasks(period);
        !tasks.is_empty() && tasks.values().all(|done| *done)
    }

    pub fn is_day_complete(&self) -> bool {
        Period::ALL.iter().all(|p| self.is_complete(*p))
    }

    /// Percentage of the period's tasks done, rounded down (0 when empty).
    pub fn progress(&self, period: Period) -> u8 {
        let tasks = self.tasks(period);
        if tasks.is_empty() {
            return 0;
        }
        let done = tasks.values().filter(|d| **d).count();
        (done * 100 / tasks.len()) as u8
    }

    /// Consecutive days, ending today, on which `period` was complete. An
    /// incomplete today does not break the streak (the day is not over);
    /// counting then starts from yesterday.
    pub fn streak(days: &[RoutineDay], period: Period, today: NaiveDate) -> u32 {
        let complete: BTreeMap<NaiveDate, bool> = days
            .iter()
            .map(|d| (d.date, d.is_complete(period)))
            .collect();
        let done = |date: NaiveDate| complete.get(&date).copied().unwrap_or(false);

        let mut cursor = if done(today) {
            today
        } else {
            today - Duration::days(1)
        };
        let mut streak = 0;
        while done(cursor) {
            streak += 1;
            cursor -= Duration::days(1);
        }
        streak
    }

    pub fn to_record(&self) -> Record {
        let map = |tasks: &BTreeMap<String, bool>| {
            tasks
                .iter()
                .map(|(k, v)| (k.clone(), Value::Bool(*v)))
                .collect::<Map<String, Value>>()
        };
        Record::new()
            .with("schemaVersion", self.schema_version)
            .with("date", self.date.to_string())
            .with("morning", map(&self.morning))
            .with("evening", map(&self.evening))
    }

    /// Decode a stored record; only current-version records are accepted.
    pub fn from_record(record: &Record) -> Result<Self, RoutineError> {
        let date = record_date(record)?;
        match VersionedRoutineDay::decode(date, &Value::Object(record.as_map().clone()))? {
            VersionedRoutineDay::Current(day) => Ok(day),
            VersionedRoutineDay::Legacy(_) => Err(RoutineError::UnsupportedVersion(LEGACY_SCHEMA_VERSION)),
        }
    }
}

fn blank(tasks: &[String]) -> BTreeMap<String, bool> {
    tasks.iter().map(|t| (t.clone(), false)).collect()
}

fn record_date(record: &Record) -> Result<NaiveDate, RoutineError> {
    let raw = record
        .get("date")
        .and_then(Value::as_str)
        .ok_or_else(|| RoutineError::InvalidDate("<missing>".to_string()))?;
    parse_date(raw)
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, RoutineError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| RoutineError::InvalidDate(raw.to_string()))
}

// ============================================================================
// Legacy shapes (schema version 1)
// ============================================================================

/// Legacy completion for one period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyPeriod {
    /// The whole period marked done (or not); individual tasks unknown.
    Whole(bool),
    /// One flag per task, in template order.
    Positional(Vec<bool>),
}

impl LegacyPeriod {
    /// `None` for any shape other than a bool or an array of bools.
    pub fn decode(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(LegacyPeriod::Whole(*b)),
            Value::Array(items) => items
                .iter()
                .map(Value::as_bool)
                .collect::<Option<Vec<bool>>>()
                .map(LegacyPeriod::Positional),
            _ => None,
        }
    }
}

/// Legacy day; a period is `None` when absent or in an unrecognized shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyRoutineDay {
    pub morning: Option<LegacyPeriod>,
    pub evening: Option<LegacyPeriod>,
}

impl LegacyRoutineDay {
    pub fn decode(date: NaiveDate, value: &Value) -> Self {
        let period = |p: Period| -> Option<LegacyPeriod> {
            let raw = value.get(p.as_str())?;
            let decoded = LegacyPeriod::decode(raw);
            if decoded.is_none() {
                warn!(%date, period = %p, "skipping unrecognized legacy routine shape");
            }
            decoded
        };
        Self {
            morning: period(Period::Morning),
            evening: period(Period::Evening),
        }
    }

    pub fn period(&self, period: Period) -> Option<&LegacyPeriod> {
        match period {
            Period::Morning => self.morning.as_ref(),
            Period::Evening => self.evening.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.morning.is_none() && self.evening.is_none()
    }
}

/// A stored routine day of any known schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionedRoutineDay {
    Legacy(LegacyRoutineDay),
    Current(RoutineDay),
}

impl VersionedRoutineDay {
    pub fn decode(date: NaiveDate, value: &Value) -> Result<Self, RoutineError> {
        if !value.is_object() {
            return Err(RoutineError::Unrecognized {
                date: date.to_string(),
                reason: "not an object".to_string(),
            });
        }
        let version = match value.get("schemaVersion") {
            None | Some(Value::Null) => LEGACY_SCHEMA_VERSION,
            Some(v) => v.as_u64().ok_or_else(|| RoutineError::Unrecognized {
                date: date.to_string(),
                reason: format!("schemaVersion {v} is not a number"),
            })?,
        };
        match version {
            LEGACY_SCHEMA_VERSION => Ok(Self::Legacy(LegacyRoutineDay::decode(date, value))),
            CURRENT_SCHEMA_VERSION => serde_json::from_value::<RoutineDay>(value.clone())
                .map(Self::Current)
                .map_err(|e| RoutineError::Unrecognized {
                    date: date.to_string(),
                    reason: e.to_string(),
                }),
            other => Err(RoutineError::UnsupportedVersion(other)),
        }
    }
}
