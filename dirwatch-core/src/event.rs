//! Subscriber-facing event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Kind of change delivered to a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Changed,
    Created,
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Changed => "changed",
            EventKind::Created => "created",
            EventKind::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// A notification for one watched path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: EventKind,
    pub is_dir: bool,
    pub timestamp: DateTime<Utc>,
}

impl WatchEvent {
    pub fn new(path: &Path, kind: EventKind, is_dir: bool) -> Self {
        Self { path: path.to_path_buf(), kind, is_dir, timestamp: Utc::now() }
    }
}

/// Receiving side of a subscriber's event channel
pub type EventReceiver = mpsc::UnboundedReceiver<WatchEvent>;

pub(crate) type EventSender = mpsc::UnboundedSender<WatchEvent>;

/// Opaque identity of a registering party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether the caller expects a file or a directory at the path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    File,
    Dir,
}

impl WatchKind {
    pub fn is_dir(self) -> bool {
        matches!(self, WatchKind::Dir)
    }
}

/// Handle for one (subscriber, path) registration.
///
/// Registering the same pair again returns an equal handle; the registration
/// is reference counted, so each `add_watch` needs a matching `remove_watch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber: SubscriberId,
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::Created.to_string(), "created");
        assert_eq!(EventKind::Deleted.to_string(), "deleted");
        assert_eq!(EventKind::Changed.to_string(), "changed");
    }

    #[test]
    fn test_subscriber_ids_are_unique() {
        assert_ne!(SubscriberId::new(), SubscriberId::new());
    }

    #[test]
    fn test_watch_kind() {
        assert!(WatchKind::Dir.is_dir());
        assert!(!WatchKind::File.is_dir());
    }
}
