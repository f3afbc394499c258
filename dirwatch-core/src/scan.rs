//! Transition classification between two metadata observations

use std::collections::BTreeMap;

use crate::entry::{ChildStamp, ContentChanges, EntryStatus, EventMask, Snapshot};
use crate::probe::Metadata;

/// Outcome of comparing an entry's stored state with a fresh probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    NoChange,
    Created,
    Changed,
    Deleted,
}

impl Transition {
    pub(crate) fn mask(self) -> EventMask {
        match self {
            Transition::NoChange => EventMask::NONE,
            Transition::Created => EventMask::CREATED,
            Transition::Changed => EventMask::CHANGED,
            Transition::Deleted => EventMask::DELETED,
        }
    }
}

/// Classify what happened to a path between two observations.
///
/// A Normal entry that was never observed (`previous == None`) only records
/// its first snapshot. Link counts matter for directories only, where they
/// move when subdirectories come and go.
pub(crate) fn classify(
    status: EntryStatus,
    is_dir: bool,
    previous: Option<Snapshot>,
    current: Option<&Metadata>,
) -> Transition {
    match (status, current) {
        (EntryStatus::NonExistent, Some(_)) => Transition::Created,
        (EntryStatus::NonExistent, None) => Transition::NoChange,
        (EntryStatus::Normal, None) => Transition::Deleted,
        (EntryStatus::Normal, Some(meta)) => {
            let Some(previous) = previous else {
                return Transition::NoChange;
            };
            let type_changed = meta.is_dir != is_dir;
            let links_changed = meta.is_dir && is_dir && previous.link_count != meta.link_count;
            if type_changed || previous.modified != meta.modified || previous.inode != meta.inode || links_changed {
                Transition::Changed
            } else {
                Transition::NoChange
            }
        }
    }
}

/// Differences between two enumerations of the same directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ChildDiff {
    /// A child appeared or disappeared
    pub listing_changed: bool,
    pub content: ContentChanges,
}

/// Compare two child listings. The first enumeration establishes a baseline.
pub(crate) fn diff_children(
    old: Option<&BTreeMap<String, ChildStamp>>,
    new: &BTreeMap<String, ChildStamp>,
) -> ChildDiff {
    let mut diff = ChildDiff::default();
    let Some(old) = old else {
        return diff;
    };

    for (name, stamp) in new {
        match old.get(name) {
            None => {
                diff.listing_changed = true;
                diff.content.record(Some(stamp.is_dir));
            }
            Some(before) if before != stamp => diff.content.record(Some(stamp.is_dir)),
            Some(_) => {}
        }
    }
    for (name, stamp) in old {
        if !new.contains_key(name) {
            diff.listing_changed = true;
            diff.content.record(Some(stamp.is_dir));
        }
    }

    diff
}
