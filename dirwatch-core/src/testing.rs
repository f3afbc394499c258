//! In-memory filesystem and scriptable backend for engine tests

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::backend::{BackendEvent, BackendEventKind, BackendMode, BackendSender, NativeBackend, WatchToken};
use crate::error::{BackendError, ProbeError};
use crate::probe::{Metadata, MetadataProbe};

#[derive(Debug, Clone, Copy)]
struct Node {
    is_dir: bool,
    modified: u64,
    inode: u64,
}

#[derive(Debug, Default)]
struct MemoryFs {
    nodes: BTreeMap<PathBuf, Node>,
    clock: u64,
    next_inode: u64,
}

impl MemoryFs {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, path: &Path, is_dir: bool) {
        let modified = self.tick();
        self.next_inode += 1;
        self.nodes.insert(path.to_path_buf(), Node { is_dir, modified, inode: self.next_inode });
        self.touch_parent(path);
    }

    fn touch_parent(&mut self, path: &Path) {
        let now = self.tick();
        if let Some(parent) = path.parent().and_then(|p| self.nodes.get_mut(p)) {
            parent.modified = now;
        }
    }
}

/// Filesystem held in memory. Clones share state.
///
/// Modification times come from a counter that advances on every mutation,
/// so successive writes are always distinguishable.
#[derive(Debug, Clone)]
pub(crate) struct MemoryProbe {
    fs: Arc<Mutex<MemoryFs>>,
}

impl MemoryProbe {
    /// Filesystem containing only `/`
    pub(crate) fn new() -> Self {
        let probe = Self { fs: Arc::new(Mutex::new(MemoryFs::default())) };
        probe.lock().insert(Path::new("/"), true);
        probe
    }

    fn lock(&self) -> MutexGuard<'_, MemoryFs> {
        self.fs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn mkdir(&self, path: impl AsRef<Path>) {
        self.lock().insert(path.as_ref(), true);
    }

    /// Create a file, or bump its modification time when it exists
    pub(crate) fn write(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut fs = self.lock();
        let now = fs.tick();
        if let Some(node) = fs.nodes.get_mut(path) {
            node.modified = now;
            return;
        }
        fs.insert(path, false);
    }

    /// Remove a path and everything below it
    pub(crate) fn remove(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut fs = self.lock();
        fs.nodes.retain(|p, _| !p.starts_with(path));
        fs.touch_parent(path);
    }

    pub(crate) fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.lock().nodes.contains_key(path.as_ref())
    }
}

impl MetadataProbe for MemoryProbe {
    fn read_metadata(&self, path: &Path) -> Result<Option<Metadata>, ProbeError> {
        let fs = self.lock();
        let Some(node) = fs.nodes.get(path) else {
            return Ok(None);
        };
        let subdirs = fs.nodes.iter().filter(|(p, n)| n.is_dir && p.parent() == Some(path)).count() as u64;

        Ok(Some(Metadata {
            modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(node.modified)),
            inode: node.inode,
            link_count: if node.is_dir { 2 + subdirs } else { 1 },
            is_dir: node.is_dir,
        }))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>, ProbeError> {
        let fs = self.lock();
        if !fs.nodes.get(path).is_some_and(|n| n.is_dir) {
            return Err(ProbeError {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            });
        }
        Ok(fs
            .nodes
            .keys()
            .filter(|p| p.parent() == Some(path) && p.as_path() != path)
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }
}

#[derive(Debug, Default)]
struct FakeState {
    watches: BTreeMap<WatchToken, PathBuf>,
    attaches: usize,
    detaches: usize,
    reject: bool,
    capacity: Option<usize>,
}

/// Event backend whose watches are plain bookkeeping
pub(crate) struct FakeBackend {
    mode: BackendMode,
    state: Arc<Mutex<FakeState>>,
}

/// Test-side view of a [`FakeBackend`]: inspects its watches and injects events
#[derive(Clone)]
pub(crate) struct FakeHandle {
    state: Arc<Mutex<FakeState>>,
    sender: BackendSender,
}

impl FakeBackend {
    pub(crate) fn new(mode: BackendMode, sender: BackendSender) -> (Self, FakeHandle) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (Self { mode, state: state.clone() }, FakeHandle { state, sender })
    }
}

fn lock_state(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl NativeBackend for FakeBackend {
    fn mode(&self) -> BackendMode {
        self.mode
    }

    fn attach(&mut self, path: &Path, _is_dir: bool, token: WatchToken) -> Result<(), BackendError> {
        let mut state = lock_state(&self.state);
        if state.reject {
            return Err(BackendError::Rejected {
                mode: self.mode,
                path: path.to_path_buf(),
                reason: "refused by test".to_string(),
            });
        }
        if state.capacity.is_some_and(|cap| state.watches.len() >= cap) {
            return Err(BackendError::Exhausted { mode: self.mode, path: path.to_path_buf() });
        }
        state.watches.insert(token, path.to_path_buf());
        state.attaches += 1;
        Ok(())
    }

    fn detach(&mut self, token: WatchToken) {
        let mut state = lock_state(&self.state);
        if state.watches.remove(&token).is_some() {
            state.detaches += 1;
        }
    }

    fn active_watches(&self) -> usize {
        lock_state(&self.state).watches.len()
    }
}

impl FakeHandle {
    pub(crate) fn active(&self) -> usize {
        lock_state(&self.state).watches.len()
    }

    pub(crate) fn attaches(&self) -> usize {
        lock_state(&self.state).attaches
    }

    pub(crate) fn detaches(&self) -> usize {
        lock_state(&self.state).detaches
    }

    pub(crate) fn is_watching(&self, path: impl AsRef<Path>) -> bool {
        lock_state(&self.state).watches.values().any(|p| p == path.as_ref())
    }

    pub(crate) fn set_reject(&self, reject: bool) {
        lock_state(&self.state).reject = reject;
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        lock_state(&self.state).capacity = Some(capacity);
    }

    /// Token attached for a path, if any
    pub(crate) fn token_for(&self, path: impl AsRef<Path>) -> Option<WatchToken> {
        lock_state(&self.state).watches.iter().find(|(_, p)| *p == path.as_ref()).map(|(t, _)| *t)
    }

    /// Report activity on a watched path; returns false when it is not watched
    pub(crate) fn emit(&self, path: impl AsRef<Path>, kind: BackendEventKind) -> bool {
        match self.token_for(path) {
            Some(token) => {
                self.sender.send(BackendEvent::new(token, kind));
                true
            }
            None => false,
        }
    }

    /// Send an event for an arbitrary token, watched or not
    pub(crate) fn emit_token(&self, token: WatchToken, kind: BackendEventKind) {
        self.sender.send(BackendEvent::new(token, kind));
    }

    pub(crate) fn overflow(&self) {
        self.sender.send(BackendEvent::rescan());
    }
}

/// Mirror a filesystem mutation as a kernel notifier would report it
pub(crate) fn report(handle: &FakeHandle, path: &Path, created: bool, deleted: bool) {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let parent = path.parent();

    if deleted {
        handle.emit(path, BackendEventKind::Deleted);
        if let Some(parent) = parent {
            handle.emit(parent, BackendEventKind::ChildDeleted(name));
        }
    } else if created {
        if let Some(parent) = parent {
            handle.emit(parent, BackendEventKind::ChildCreated(name));
        }
    } else {
        handle.emit(path, BackendEventKind::Modified);
        if let Some(parent) = parent {
            handle.emit(parent, BackendEventKind::ChildModified(name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_probe_tracks_parent_mtime_and_links() {
        let fs = MemoryProbe::new();
        fs.mkdir("/tmp");
        let before = fs.read_metadata(Path::new("/tmp")).unwrap().unwrap();

        fs.mkdir("/tmp/sub");
        let after = fs.read_metadata(Path::new("/tmp")).unwrap().unwrap();
        assert!(after.modified > before.modified);
        assert_eq!(after.link_count, before.link_count + 1);

        fs.write("/tmp/sub/a");
        assert_eq!(fs.read_dir(Path::new("/tmp")).unwrap(), vec!["sub".to_string()]);
        fs.remove("/tmp/sub");
        assert!(!fs.exists("/tmp/sub/a"));
    }
}
