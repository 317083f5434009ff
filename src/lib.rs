pub mod error;
pub mod types;

pub mod auth;
pub mod backup;
pub mod config;
pub mod context;
pub mod logging;
pub mod remote;
pub mod routine;
pub mod storage;
pub mod sync;

pub use context::SyncContext;
pub use error::{LifeOsError, Result};
