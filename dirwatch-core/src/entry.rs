//! Per-path watch state and per-subscriber registrations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::backend::{BackendMode, WatchToken};
use crate::error::{WatchError, WatchResult};
use crate::event::{EventKind, SubscriberId};
use crate::probe::Metadata;

/// Whether the watched path currently exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Normal,
    NonExistent,
}

/// Granularity of a directory watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatchModes {
    /// Report changes to files directly inside the directory
    pub files: bool,
    /// Report changes to subdirectories directly inside the directory
    pub subdirs: bool,
}

impl WatchModes {
    pub const DIR_ONLY: WatchModes = WatchModes { files: false, subdirs: false };
    pub const FILES: WatchModes = WatchModes { files: true, subdirs: false };
    pub const SUBDIRS: WatchModes = WatchModes { files: false, subdirs: true };
    pub const CONTENTS: WatchModes = WatchModes { files: true, subdirs: true };

    pub fn union(self, other: WatchModes) -> WatchModes {
        WatchModes { files: self.files || other.files, subdirs: self.subdirs || other.subdirs }
    }

    pub fn watches_contents(self) -> bool {
        self.files || self.subdirs
    }

    /// Whether a change to a child of the given type is of interest.
    /// `None` means the type is unknown (the child is already gone).
    pub fn wants_child(self, is_dir: Option<bool>) -> bool {
        match is_dir {
            Some(true) => self.subdirs,
            Some(false) => self.files,
            None => self.watches_contents(),
        }
    }
}

/// Internal event bitmask; several underlying changes fold into one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct EventMask(u8);

impl EventMask {
    pub(crate) const NONE: EventMask = EventMask(0);
    pub(crate) const CHANGED: EventMask = EventMask(1);
    pub(crate) const CREATED: EventMask = EventMask(2);
    pub(crate) const DELETED: EventMask = EventMask(4);

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0 && !other.is_empty()
    }

    /// Created and Deleted dominate Changed
    pub(crate) fn strongest(self) -> Option<EventKind> {
        if self.contains(Self::DELETED) {
            Some(EventKind::Deleted)
        } else if self.contains(Self::CREATED) {
            Some(EventKind::Created)
        } else if self.contains(Self::CHANGED) {
            Some(EventKind::Changed)
        } else {
            None
        }
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

/// Last observed metadata; `None` on the entry is the "never observed" sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub modified: Option<SystemTime>,
    pub inode: u64,
    pub link_count: u64,
}

impl From<&Metadata> for Snapshot {
    fn from(meta: &Metadata) -> Self {
        Self { modified: meta.modified, inode: meta.inode, link_count: meta.link_count }
    }
}

/// What the last enumeration saw of one child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildStamp {
    pub modified: Option<SystemTime>,
    pub is_dir: bool,
}

/// One subscriber's registration against an entry
#[derive(Debug, Clone)]
pub(crate) struct Client {
    pub subscriber: SubscriberId,
    pub count: usize,
    pub paused: bool,
    pub pending: EventMask,
    pub modes: WatchModes,
}

impl Client {
    fn new(subscriber: SubscriberId, modes: WatchModes) -> Self {
        Self { subscriber, count: 1, paused: false, pending: EventMask::NONE, modes }
    }

    /// Fold an event into what accrued while paused
    pub(crate) fn accrue(&mut self, event: EventMask) {
        if event.contains(EventMask::CREATED) || event.contains(EventMask::DELETED) {
            self.pending = event;
        } else {
            self.pending |= event;
        }
    }
}

/// Content changes seen among a directory's children during one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ContentChanges {
    pub files: bool,
    pub subdirs: bool,
    pub unknown: bool,
}

impl ContentChanges {
    pub(crate) fn record(&mut self, is_dir: Option<bool>) {
        match is_dir {
            Some(true) => self.subdirs = true,
            Some(false) => self.files = true,
            None => self.unknown = true,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        !(self.files || self.subdirs || self.unknown)
    }

    pub(crate) fn merge(&mut self, other: ContentChanges) {
        self.files |= other.files;
        self.subdirs |= other.subdirs;
        self.unknown |= other.unknown;
    }

    pub(crate) fn interests(&self, modes: WatchModes) -> bool {
        (self.files && modes.wants_child(Some(false)))
            || (self.subdirs && modes.wants_child(Some(true)))
            || (self.unknown && modes.wants_child(None))
    }
}

/// Watch state for one canonical path
#[derive(Debug)]
pub(crate) struct Entry {
    pub path: PathBuf,
    pub status: EntryStatus,
    pub mode: BackendMode,
    pub is_dir: bool,
    pub snapshot: Option<Snapshot>,
    pub poll_interval_ms: u64,
    pub poll_remaining_ms: i64,
    /// Needs a re-stat at the next scan
    pub dirty: bool,
    /// Backend reported a change the stat snapshot may not show
    pub forced_change: bool,
    /// Content changes reported by the backend since the last scan
    pub pending_content: ContentChanges,
    pub clients: Vec<Client>,
    /// NonExistent children nested under this entry, by path
    pub sub_entries: Vec<PathBuf>,
    /// Entry this one is nested under while it does not exist
    pub parent: Option<PathBuf>,
    pub token: Option<WatchToken>,
    /// Last enumeration of a polled directory
    pub children: Option<BTreeMap<String, ChildStamp>>,
}

impl Entry {
    pub(crate) fn new(path: PathBuf, is_dir: bool, meta: Option<&Metadata>) -> Self {
        let (status, is_dir, snapshot) = match meta {
            Some(meta) => (EntryStatus::Normal, meta.is_dir, Some(Snapshot::from(meta))),
            None => (EntryStatus::NonExistent, is_dir, None),
        };
        Self {
            path,
            status,
            mode: BackendMode::Unknown,
            is_dir,
            snapshot,
            poll_interval_ms: 0,
            poll_remaining_ms: 0,
            dirty: false,
            forced_change: false,
            pending_content: ContentChanges::default(),
            clients: Vec::new(),
            sub_entries: Vec::new(),
            parent: None,
            token: None,
            children: None,
        }
    }

    /// An entry is alive while someone watches it or something is nested under it
    pub(crate) fn is_valid(&self) -> bool {
        !self.clients.is_empty() || !self.sub_entries.is_empty()
    }

    pub(crate) fn client(&self, subscriber: SubscriberId) -> Option<&Client> {
        self.clients.iter().find(|c| c.subscriber == subscriber)
    }

    pub(crate) fn client_mut(&mut self, subscriber: SubscriberId) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.subscriber == subscriber)
    }

    /// Register a client, collapsing repeats into a reference count
    pub(crate) fn add_client(&mut self, subscriber: SubscriberId, modes: WatchModes) {
        match self.client_mut(subscriber) {
            Some(client) => {
                client.count += 1;
                client.modes = client.modes.union(modes);
            }
            None => self.clients.push(Client::new(subscriber, modes)),
        }
    }

    /// Drop one reference; returns false when the subscriber had none
    pub(crate) fn remove_client(&mut self, subscriber: SubscriberId) -> bool {
        let Some(idx) = self.clients.iter().position(|c| c.subscriber == subscriber) else {
            return false;
        };
        self.clients[idx].count -= 1;
        if self.clients[idx].count == 0 {
            self.clients.remove(idx);
        }
        true
    }

    pub(crate) fn add_sub_entry(&mut self, path: &Path) {
        if !self.sub_entries.iter().any(|p| p == path) {
            self.sub_entries.push(path.to_path_buf());
        }
    }

    pub(crate) fn remove_sub_entry(&mut self, path: &Path) {
        self.sub_entries.retain(|p| p != path);
    }

    pub(crate) fn wants_contents(&self) -> bool {
        self.is_dir && self.clients.iter().any(|c| c.modes.watches_contents())
    }
}

/// Parent directory used to watch for this path's creation
pub(crate) fn parent_directory(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

/// Absolute, lexically clean form of a path.
///
/// The path may not exist yet, so symlinks are not resolved.
pub fn normalize_path(path: &Path) -> WatchResult<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| WatchError::InvalidPath { path: path.to_path_buf(), reason: e.to_string() })?;
        cwd.join(path)
    };

    let mut clean = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other.as_os_str()),
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(WatchError::InvalidPath { path: path.to_path_buf(), reason: "empty path".to_string() });
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber() -> SubscriberId {
        SubscriberId::new()
    }

    #[test]
    fn test_event_mask_strongest() {
        assert_eq!(EventMask::NONE.strongest(), None);
        assert_eq!(EventMask::CHANGED.strongest(), Some(EventKind::Changed));
        assert_eq!((EventMask::CHANGED | EventMask::CREATED).strongest(), Some(EventKind::Created));
        assert_eq!((EventMask::CREATED | EventMask::DELETED).strongest(), Some(EventKind::Deleted));
    }

    #[test]
    fn test_client_refcount() {
        let mut entry = Entry::new(PathBuf::from("/a"), false, None);
        let id = subscriber();
        entry.add_client(id, WatchModes::DIR_ONLY);
        entry.add_client(id, WatchModes::FILES);
        assert_eq!(entry.clients.len(), 1);
        assert_eq!(entry.client(id).map(|c| c.count), Some(2));
        assert_eq!(entry.client(id).map(|c| c.modes), Some(WatchModes::FILES));

        assert!(entry.remove_client(id));
        assert!(entry.is_valid());
        assert!(entry.remove_client(id));
        assert!(!entry.is_valid());
        assert!(!entry.remove_client(id));
    }

    #[test]
    fn test_sub_entries_keep_entry_valid() {
        let mut entry = Entry::new(PathBuf::from("/a"), true, None);
        entry.add_sub_entry(Path::new("/a/b"));
        entry.add_sub_entry(Path::new("/a/b"));
        assert_eq!(entry.sub_entries.len(), 1);
        assert!(entry.is_valid());
        entry.remove_sub_entry(Path::new("/a/b"));
        assert!(!entry.is_valid());
    }

    #[test]
    fn test_paused_client_keeps_strongest_pending() {
        let mut client = Client::new(subscriber(), WatchModes::DIR_ONLY);
        client.accrue(EventMask::CHANGED);
        client.accrue(EventMask::CHANGED);
        assert_eq!(client.pending, EventMask::CHANGED);
        client.accrue(EventMask::DELETED);
        assert_eq!(client.pending.strongest(), Some(EventKind::Deleted));
    }

    #[test]
    fn test_watch_modes_child_interest() {
        assert!(!WatchModes::DIR_ONLY.wants_child(None));
        assert!(WatchModes::FILES.wants_child(Some(false)));
        assert!(!WatchModes::FILES.wants_child(Some(true)));
        assert!(WatchModes::SUBDIRS.wants_child(Some(true)));
        assert!(WatchModes::CONTENTS.wants_child(None));
    }

    #[test]
    fn test_content_changes_interest() {
        let mut changes = ContentChanges::default();
        assert!(changes.is_empty());
        changes.record(Some(true));
        assert!(changes.interests(WatchModes::SUBDIRS));
        assert!(!changes.interests(WatchModes::FILES));
        changes.record(None);
        assert!(changes.interests(WatchModes::FILES));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/tmp/./a/../b/")).unwrap(), PathBuf::from("/tmp/b"));
        let relative = normalize_path(Path::new("x")).unwrap();
        assert!(relative.is_absolute());
        assert!(relative.ends_with("x"));
    }

    #[test]
    fn test_parent_directory() {
        assert_eq!(parent_directory(Path::new("/tmp/a")), Some(Path::new("/tmp")));
        assert_eq!(parent_directory(Path::new("/")), None);
    }
}
