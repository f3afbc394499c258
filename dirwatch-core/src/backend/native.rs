//! Kernel and watch-service backends built on the notify crate

use dashmap::DashMap;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, trace};

use super::{BackendEvent, BackendEventKind, BackendMode, BackendSender, NativeBackend, WatchToken};
use crate::error::BackendError;

/// Wraps a notify watcher in non-recursive mode, one native watch per token.
///
/// The path table is shared with the watcher's callback thread so raw events
/// can be translated to tokens before they are queued.
///
/// Paths are keyed lexically and symlinks are not resolved. Two entries that
/// reach the same inode through different names share one inotify descriptor
/// inside notify, so detaching either of them also silences the other.
pub struct NotifyBackend<W: Watcher> {
    mode: BackendMode,
    watcher: W,
    watched: Arc<DashMap<PathBuf, WatchToken>>,
    paths: HashMap<WatchToken, PathBuf>,
}

impl<W: Watcher> NotifyBackend<W> {
    /// Create the backend; fails when the host mechanism cannot be initialised
    pub fn new(mode: BackendMode, sender: BackendSender) -> Result<Self, BackendError> {
        let watched: Arc<DashMap<PathBuf, WatchToken>> = Arc::new(DashMap::new());
        let table = watched.clone();

        let watcher = W::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for translated in translate(&event, &table) {
                        sender.send(translated);
                    }
                }
                Err(e) => error!("Watch error: {:?}", e),
            },
            Config::default(),
        )
        .map_err(|e| BackendError::Unavailable { mode, reason: e.to_string() })?;

        debug!("Initialised {} backend", mode);
        Ok(Self { mode, watcher, watched, paths: HashMap::new() })
    }
}

impl<W: Watcher + Send + 'static> NativeBackend for NotifyBackend<W> {
    fn mode(&self) -> BackendMode {
        self.mode
    }

    fn attach(&mut self, path: &Path, _is_dir: bool, token: WatchToken) -> Result<(), BackendError> {
        if self.paths.contains_key(&token) {
            return Ok(());
        }

        // Registered before the native call so the first events are not lost
        self.watched.insert(path.to_path_buf(), token);
        if let Err(e) = self.watcher.watch(path, RecursiveMode::NonRecursive) {
            self.watched.remove(path);
            return Err(map_error(self.mode, path, e));
        }

        self.paths.insert(token, path.to_path_buf());
        debug!("{} watching {:?} ({:?})", self.mode, path, token);
        Ok(())
    }

    fn detach(&mut self, token: WatchToken) {
        let Some(path) = self.paths.remove(&token) else {
            return;
        };
        self.watched.remove(&path);

        // The kernel drops the watch by itself once the path is deleted
        if let Err(e) = self.watcher.unwatch(&path) {
            trace!("Unwatch {:?} after removal: {}", path, e);
        }
        debug!("{} released {:?} ({:?})", self.mode, path, token);
    }

    fn active_watches(&self) -> usize {
        self.paths.len()
    }
}

fn map_error(mode: BackendMode, path: &Path, e: notify::Error) -> BackendError {
    match e.kind {
        notify::ErrorKind::MaxFilesWatch => BackendError::Exhausted { mode, path: path.to_path_buf() },
        _ => BackendError::Rejected { mode, path: path.to_path_buf(), reason: e.to_string() },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawChange {
    Created,
    Removed,
    Modified,
}

fn raw_change(kind: &EventKind, index: usize) -> Option<RawChange> {
    match kind {
        EventKind::Create(_) => Some(RawChange::Created),
        EventKind::Remove(_) => Some(RawChange::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(RawChange::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(RawChange::Created),
        // paths are [from, to]
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            Some(if index == 0 { RawChange::Removed } else { RawChange::Created })
        }
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(RawChange::Modified),
        EventKind::Access(_) => None,
    }
}

/// Turn one notify event into per-token backend events.
///
/// A path can be both a watched entry and a child of a watched directory;
/// both watches hear about it, the same way two inotify descriptors would.
pub(crate) fn translate(event: &Event, watched: &DashMap<PathBuf, WatchToken>) -> Vec<BackendEvent> {
    if event.need_rescan() {
        return vec![BackendEvent::rescan()];
    }

    let mut out = Vec::new();
    for (index, path) in event.paths.iter().enumerate() {
        let Some(change) = raw_change(&event.kind, index) else {
            continue;
        };

        if let Some(token) = watched.get(path).map(|t| *t) {
            let kind = match change {
                RawChange::Removed => BackendEventKind::Deleted,
                RawChange::Created | RawChange::Modified => BackendEventKind::Modified,
            };
            out.push(BackendEvent::new(token, kind));
        }

        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            continue;
        };
        if let Some(token) = watched.get(parent).map(|t| *t) {
            let name = name.to_string_lossy().into_owned();
            let kind = match change {
                RawChange::Created => BackendEventKind::ChildCreated(name),
                RawChange::Removed => BackendEventKind::ChildDeleted(name),
                RawChange::Modified => BackendEventKind::ChildModified(name),
            };
            out.push(BackendEvent::new(token, kind));
        }
    }

    out
}
