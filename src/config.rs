//! Runtime configuration for the sync engine.
//!
//! Every field has a default, so an empty JSON object is a valid (if
//! remote-less) config. Environment variables override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_REST_URL: &str = "LIFEOS_REST_URL";
pub const ENV_API_KEY: &str = "LIFEOS_API_KEY";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "LIFEOS_REQUEST_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the table-style REST endpoint, e.g.
    /// `https://project.example.co/rest/v1`.
    pub rest_url: Option<String>,
    /// Public API key sent as the `apikey` header.
    pub api_key: Option<String>,
    /// Deadline for every remote call. Expiry counts as a retryable failure.
    pub request_timeout_ms: u64,
    /// Period of the background drain loop.
    pub drain_interval_secs: u64,
    /// Failed replays before an entry is dead-lettered.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt. `0` disables backoff.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Upper bound on records kept per cache key.
    pub max_cached_records: Option<usize>,
    /// SQLite file for durable local storage (`None` = in-memory).
    pub storage_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rest_url: None,
            api_key: None,
            request_timeout_ms: 10_000,
            drain_interval_secs: 30,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            max_cached_records: None,
            storage_path: None,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Override fields from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Override fields from an arbitrary variable source.
    pub fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(url) = var(ENV_REST_URL) {
            self.rest_url = Some(url);
        }
        if let Some(key) = var(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(raw) = var(ENV_REQUEST_TIMEOUT_MS) {
            self.request_timeout_ms = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "request_timeout_ms",
                reason: format!("{raw:?} is not a whole number of milliseconds"),
            })?;
        }
        Ok(self)
    }

    /// Check the settings needed to talk to the remote store.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.rest_url.as_deref().ok_or(ConfigError::Missing("rest_url"))?;
        reqwest::Url::parse(url).map_err(|e| ConfigError::Invalid {
            field: "rest_url",
            reason: e.to_string(),
        })?;
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.drain_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "drain_interval_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid {
                field: "backoff_max_ms",
                reason: "must not be smaller than backoff_base_ms".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}
