//! Error types for watch operations
//!
//! Only `WatchError` ever reaches callers. Backend and probe failures are
//! absorbed by the engine: a probe failure reads as "path does not exist" and
//! a backend failure degrades the entry to polling.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::backend::BackendMode;
use crate::event::SubscriberId;

/// Errors reported to subscribers
#[derive(Debug, Error)]
pub enum WatchError {
    /// Operation on a registration that does not exist (or was already removed)
    #[error("No watch on {path:?} for subscriber {subscriber}")]
    InvalidSubscription { subscriber: SubscriberId, path: PathBuf },

    /// Subscriber identity was never created by this engine
    #[error("Unknown subscriber {0}")]
    UnknownSubscriber(SubscriberId),

    /// Path could not be turned into an absolute path
    #[error("Invalid watch path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// Configuration rejected by validation
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The service task is gone
    #[error("Watch service has stopped")]
    ServiceStopped,
}

/// Failures of a native notification mechanism
#[derive(Debug, Error)]
pub enum BackendError {
    /// The mechanism refused this path; try the next one in precedence order
    #[error("{mode} rejected {path:?}: {reason}")]
    Rejected { mode: BackendMode, path: PathBuf, reason: String },

    /// No free descriptors or request slots left
    #[error("{mode} has no free watch slots for {path:?}")]
    Exhausted { mode: BackendMode, path: PathBuf },

    /// The mechanism cannot be used on this host
    #[error("{mode} is not available: {reason}")]
    Unavailable { mode: BackendMode, reason: String },
}

/// Metadata probe failure other than "not found"
#[derive(Debug, Error)]
#[error("Failed to probe {path:?}: {source}")]
pub struct ProbeError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Result type for watch operations
pub type WatchResult<T> = std::result::Result<T, WatchError>;
