use thiserror::Error;

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Stored value under \"{key}\" is not valid JSON")]
    Corruption {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize value for \"{key}\"")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// How a queued mutation should be treated after a failed remote attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Try again later (network, timeout, 5xx, 408, 429).
    Retry,
    /// Never succeeds as-is; move straight to the dead-letter list.
    Reject,
    /// Stop talking to the remote for this session.
    Halt,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote call timed out after {0} ms")]
    Timeout(u64),

    #[error("Authorization expired")]
    AuthExpired,

    #[error("Conflict writing to \"{collection}\": {body}")]
    Conflict { collection: String, body: String },

    #[error("Remote returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode remote response: {0}")]
    Decode(String),

    #[error("Invalid remote request: {0}")]
    InvalidRequest(String),

    #[error("Remote store is not configured: {0}")]
    NotConfigured(String),
}

impl RemoteError {
    pub fn disposition(&self) -> FailureDisposition {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout(_) => FailureDisposition::Retry,
            RemoteError::AuthExpired => FailureDisposition::Halt,
            RemoteError::Status { status, .. } => match *status {
                408 | 425 | 429 => FailureDisposition::Retry,
                s if s >= 500 => FailureDisposition::Retry,
                _ => FailureDisposition::Reject,
            },
            RemoteError::Conflict { .. } | RemoteError::InvalidRequest(_) => {
                FailureDisposition::Reject
            }
            // A body we cannot parse is usually a proxy/captive-portal page.
            RemoteError::Decode(_) => FailureDisposition::Retry,
            RemoteError::NotConfigured(_) => FailureDisposition::Halt,
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, RemoteError::AuthExpired)
    }
}

// ---------------------------------------------------------------------------
// RoutineError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RoutineError {
    #[error("Unsupported routine schema version {0}")]
    UnsupportedVersion(u64),

    #[error("Unrecognized routine data for {date}: {reason}")]
    Unrecognized { date: String, reason: String },

    #[error("Invalid date \"{0}\"")]
    InvalidDate(String),
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting \"{0}\"")]
    Missing(&'static str),

    #[error("Invalid value for \"{field}\": {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// LifeOsError: top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LifeOsError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Routine(#[from] RoutineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience alias; the default error type is `LifeOsError`.
pub type Result<T, E = LifeOsError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
