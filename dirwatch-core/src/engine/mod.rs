//! The watch engine
//!
//! `DirWatchEngine` owns the entry table and every native watch resource.
//! It is driven from a single owner: timer ticks call [`DirWatchEngine::tick`],
//! backend wakeups call [`DirWatchEngine::rescan`], and registrations go
//! through `&mut self`. Backends running on other threads only push onto the
//! engine's queue, so entry state is never mutated concurrently.
//!
//! Entries live in a map keyed by canonical path. A path that does not exist
//! yet is nested under the entry of its parent directory (by path, never by
//! reference), which is watched for the child's creation. Chains of missing
//! ancestors nest the same way up to the nearest existing directory.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, trace, warn};

use pattern_utils::NoiseFilter;

use crate::backend::{
    self, BackendEvent, BackendEventKind, BackendMode, BackendQueue, BackendSender, BackendSet, NativeBackend,
    WatchToken,
};
use crate::config::{NetworkPaths, WatchConfig};
use crate::entry::{
    ChildStamp, ContentChanges, Entry, EntryStatus, EventMask, Snapshot, WatchModes, normalize_path,
    parent_directory,
};
use crate::error::{BackendError, WatchError, WatchResult};
use crate::event::{EventKind, EventReceiver, EventSender, SubscriberId, Subscription, WatchEvent, WatchKind};
use crate::probe::{FsProbe, Metadata, MetadataProbe};
use crate::scan::{Transition, classify, diff_children};


/// What keeps an entry alive
enum Link {
    Client(SubscriberId, WatchModes),
    SubEntry(PathBuf),
}

/// Result of one scan pass for one entry
#[derive(Debug, Clone, Copy, Default)]
struct Outcome {
    mask: EventMask,
    content: ContentChanges,
}

/// Summary returned by [`DirWatchEngine::statistics`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub entries: usize,
    pub nonexistent: usize,
    pub clients: usize,
    pub subscribers: usize,
    pub by_backend: BTreeMap<BackendMode, usize>,
    pub native_watches: usize,
    pub poll_period_ms: Option<u64>,
    pub pending_removals: usize,
}

/// Process-wide change notification engine
pub struct DirWatchEngine {
    config: WatchConfig,
    noise: NoiseFilter,
    network: NetworkPaths,
    probe: Box<dyn MetadataProbe>,
    backends: BackendSet,
    queue: BackendQueue,
    entries: BTreeMap<PathBuf, Entry>,
    descriptors: HashMap<WatchToken, PathBuf>,
    next_token: u64,
    subscribers: HashMap<SubscriberId, EventSender>,
    poll_period_ms: Option<u64>,
    /// Set while a scan pass iterates the table
    scanning: bool,
    /// Entries found unreferenced during a scan, destroyed once it completes
    removal_queue: BTreeSet<PathBuf>,
    rescan_all: bool,
    rescan_requested: bool,
}

impl DirWatchEngine {
    /// Engine on the real filesystem with every mechanism this host offers
    pub fn new(config: WatchConfig) -> WatchResult<Self> {
        let mut engine = Self::with_probe(config, FsProbe)?;
        for backend in backend::host_backends(&engine.backend_sender()) {
            engine.install_backend(backend);
        }
        Ok(engine)
    }

    /// Engine with a custom probe and no native backends (polling only until
    /// backends are installed)
    pub fn with_probe(config: WatchConfig, probe: impl MetadataProbe + 'static) -> WatchResult<Self> {
        config.validate()?;
        let noise = config.noise_filter();
        let network = config.network_matcher()?;

        Ok(Self {
            config,
            noise,
            network,
            probe: Box::new(probe),
            backends: BackendSet::default(),
            queue: BackendQueue::new(),
            entries: BTreeMap::new(),
            descriptors: HashMap::new(),
            next_token: 1,
            subscribers: HashMap::new(),
            poll_period_ms: None,
            scanning: false,
            removal_queue: BTreeSet::new(),
            rescan_all: false,
            rescan_requested: false,
        })
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Queue handle for backends constructed outside the engine
    pub fn backend_sender(&self) -> BackendSender {
        self.queue.sender()
    }

    pub(crate) fn waker(&self) -> Arc<Notify> {
        self.queue.waker()
    }

    /// Install a backend. Entries served by a replaced backend of the same
    /// mode are detached from the old one and attached again.
    pub fn install_backend(&mut self, backend: Box<dyn NativeBackend>) {
        let mode = backend.mode();
        let affected: Vec<PathBuf> =
            self.entries.values().filter(|e| e.mode == mode && e.token.is_some()).map(|e| e.path.clone()).collect();
        for path in &affected {
            self.detach(path);
        }

        if self.backends.install(backend).is_some() {
            debug!("Replaced {} backend", mode);
        } else {
            info!("Installed {} backend", mode);
        }

        for path in &affected {
            self.attach(path);
        }
    }

    /// Mechanisms usable on this engine, polling included
    pub fn available_backends(&self) -> Vec<BackendMode> {
        let mut modes = self.backends.modes();
        modes.push(BackendMode::Polling);
        modes.sort();
        modes
    }

    /// Create a subscriber identity and its event channel
    pub fn subscribe(&mut self) -> (SubscriberId, EventReceiver) {
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        debug!("New subscriber {}", id);
        (id, rx)
    }

    /// Watch `path` for `subscriber`.
    ///
    /// The path does not have to exist; its creation is reported as a
    /// `Created` event. Repeated registrations of the same pair are counted.
    pub fn add_watch(
        &mut self,
        subscriber: SubscriberId,
        path: impl AsRef<Path>,
        kind: WatchKind,
        modes: WatchModes,
    ) -> WatchResult<Subscription> {
        if !self.subscribers.contains_key(&subscriber) {
            return Err(WatchError::UnknownSubscriber(subscriber));
        }
        let path = normalize_path(path.as_ref())?;

        self.add_entry(&path, Link::Client(subscriber, modes), kind.is_dir());
        info!("Watching {:?} for {} ({:?}, {:?})", path, subscriber, kind, modes);

        Ok(Subscription { subscriber, path })
    }

    /// Drop one reference of a registration
    pub fn remove_watch(&mut self, subscription: &Subscription) -> WatchResult<()> {
        let removed = self
            .entries
            .get_mut(&subscription.path)
            .is_some_and(|entry| entry.remove_client(subscription.subscriber));
        if !removed {
            return Err(invalid(subscription));
        }

        debug!("Removed a watch on {:?} for {}", subscription.path, subscription.subscriber);
        self.prune(&subscription.path);
        Ok(())
    }

    /// Drop every registration of a subscriber; returns how many paths it watched
    pub fn remove_all(&mut self, subscriber: SubscriberId) -> usize {
        let paths: Vec<PathBuf> = self
            .entries
            .values_mut()
            .filter_map(|entry| {
                let before = entry.clients.len();
                entry.clients.retain(|c| c.subscriber != subscriber);
                (entry.clients.len() != before).then(|| entry.path.clone())
            })
            .collect();

        for path in &paths {
            self.prune(path);
        }
        debug!("Removed {} watches of {}", paths.len(), subscriber);
        paths.len()
    }

    /// Suppress delivery for a registration; the backend stays attached
    pub fn stop(&mut self, subscription: &Subscription) -> WatchResult<()> {
        let client = self
            .entries
            .get_mut(&subscription.path)
            .and_then(|entry| entry.client_mut(subscription.subscriber))
            .ok_or_else(|| invalid(subscription))?;

        if !client.paused {
            client.paused = true;
            client.pending = EventMask::NONE;
        }
        Ok(())
    }

    /// Resume delivery. With `replay`, anything that happened while stopped
    /// is reported as one `Changed` event.
    pub fn start(&mut self, subscription: &Subscription, replay: bool) -> WatchResult<()> {
        let entry = self.entries.get_mut(&subscription.path).ok_or_else(|| invalid(subscription))?;
        let is_dir = entry.is_dir;
        let client = entry.client_mut(subscription.subscriber).ok_or_else(|| invalid(subscription))?;

        if !client.paused {
            return Ok(());
        }
        client.paused = false;
        let pending = std::mem::take(&mut client.pending);

        if replay && !pending.is_empty() {
            let event = WatchEvent::new(&subscription.path, EventKind::Changed, is_dir);
            self.deliver(subscription.subscriber, event);
        }
        Ok(())
    }

    /// Pause every registration of a subscriber; returns how many were paused
    pub fn stop_all(&mut self, subscriber: SubscriberId) -> usize {
        let mut stopped = 0;
        for entry in self.entries.values_mut() {
            if let Some(client) = entry.client_mut(subscriber)
                && !client.paused
            {
                client.paused = true;
                client.pending = EventMask::NONE;
                stopped += 1;
            }
        }
        stopped
    }

    /// Resume every registration of a subscriber; returns how many resumed
    pub fn start_all(&mut self, subscriber: SubscriberId, replay: bool) -> usize {
        let subscriptions: Vec<Subscription> = self
            .entries
            .values()
            .filter(|entry| entry.client(subscriber).is_some_and(|c| c.paused))
            .map(|entry| Subscription { subscriber, path: entry.path.clone() })
            .collect();

        for subscription in &subscriptions {
            // Collected from the table above, cannot be missing
            let _ = self.start(subscription, replay);
        }
        subscriptions.len()
    }

    pub fn is_paused(&self, subscription: &Subscription) -> WatchResult<bool> {
        self.entries
            .get(&subscription.path)
            .and_then(|entry| entry.client(subscription.subscriber))
            .map(|client| client.paused)
            .ok_or_else(|| invalid(subscription))
    }

    /// Whether any subscriber watches this path
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        normalize_path(path.as_ref())
            .ok()
            .and_then(|path| self.entries.get(&path))
            .is_some_and(|entry| !entry.clients.is_empty())
    }

    /// Last observed modification time of a watched path
    pub fn last_modified(&self, path: impl AsRef<Path>) -> Option<SystemTime> {
        let path = normalize_path(path.as_ref()).ok()?;
        self.entries.get(&path)?.snapshot?.modified
    }

    /// Re-examine every entry at the next scan
    pub fn rescan_all(&mut self) {
        self.rescan_all = true;
        self.rescan_requested = true;
    }

    /// Whether backend activity is waiting for a scan
    pub fn needs_rescan(&self) -> bool {
        self.rescan_requested
    }

    /// Global polling period: the shortest interval among polled entries
    pub fn poll_period(&self) -> Option<Duration> {
        self.poll_period_ms.map(Duration::from_millis)
    }

    /// Timer-driven pass: polled entries age by `elapsed`
    pub fn tick(&mut self, elapsed: Duration) {
        self.process_backend_events();
        let elapsed_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
        self.scan(elapsed_ms);
    }

    /// Event-driven pass: only entries the backends marked are examined
    pub fn rescan(&mut self) {
        self.process_backend_events();
        self.scan(0);
    }

    /// Drain the backend queue; returns the number of events handled
    pub fn process_backend_events(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.queue.try_recv() {
            self.handle_backend_event(event);
            handled += 1;
        }
        handled
    }

    /// Log every entry and summarise the table
    pub fn statistics(&self) -> EngineStats {
        let mut stats = EngineStats {
            entries: self.entries.len(),
            subscribers: self.subscribers.len(),
            native_watches: self.backends.active_watches(),
            poll_period_ms: self.poll_period_ms,
            pending_removals: self.removal_queue.len(),
            ..EngineStats::default()
        };

        debug!("Entries watched: {}", self.entries.len());
        for entry in self.entries.values() {
            if entry.status == EntryStatus::NonExistent {
                stats.nonexistent += 1;
            }
            stats.clients += entry.clients.len();
            *stats.by_backend.entry(entry.mode).or_default() += 1;

            debug!(
                "  {:?} {:?} {} {} interval={}ms parent={:?}",
                entry.path,
                entry.status,
                if entry.is_dir { "dir" } else { "file" },
                entry.mode,
                entry.poll_interval_ms,
                entry.parent
            );
            for client in &entry.clients {
                debug!("    client {} count={} paused={} modes={:?}", client.subscriber, client.count, client.paused, client.modes);
            }
            for sub in &entry.sub_entries {
                debug!("    waiting for {:?}", sub);
            }
        }

        stats
    }

    /// Release every native resource and drop all entries.
    /// Subscriber channels close, ending their streams.
    pub fn shutdown(&mut self) {
        let paths: Vec<PathBuf> = self.entries.keys().cloned().collect();
        for path in &paths {
            self.detach(path);
        }
        self.entries.clear();
        self.removal_queue.clear();
        self.subscribers.clear();
        if !paths.is_empty() {
            info!("Watch engine shut down, released {} entries", paths.len());
        }
    }

    // Entry table

    fn add_entry(&mut self, path: &Path, link: Link, is_dir: bool) {
        if let Some(entry) = self.entries.get_mut(path) {
            match link {
                Link::Client(subscriber, modes) => entry.add_client(subscriber, modes),
                Link::SubEntry(sub) => entry.add_sub_entry(&sub),
            }
            return;
        }

        let meta = probe_path(self.probe.as_ref(), path);
        if let Some(meta) = &meta
            && meta.is_dir != is_dir
        {
            debug!("{:?} is a {}, watched as a {}", path, kind_name(meta.is_dir), kind_name(is_dir));
        }

        let mut entry = Entry::new(path.to_path_buf(), is_dir, meta.as_ref());
        match link {
            Link::Client(subscriber, modes) => entry.add_client(subscriber, modes),
            Link::SubEntry(sub) => entry.add_sub_entry(&sub),
        }
        trace!("Added entry {:?} ({:?})", path, entry.status);
        self.entries.insert(path.to_path_buf(), entry);

        self.attach(path);
    }

    /// Drop an entry nobody references any more, then its unreferenced ancestors.
    /// During a scan the removal waits on the queue.
    fn prune(&mut self, path: &Path) {
        let Some(entry) = self.entries.get(path) else {
            return;
        };
        if entry.is_valid() {
            return;
        }
        if self.scanning {
            self.removal_queue.insert(path.to_path_buf());
            return;
        }
        self.destroy(path);
    }

    fn destroy(&mut self, path: &Path) {
        self.removal_queue.remove(path);
        self.detach(path);
        let Some(entry) = self.entries.remove(path) else {
            return;
        };
        debug!("Removed entry {:?}", path);

        if let Some(parent) = entry.parent {
            if let Some(parent_entry) = self.entries.get_mut(&parent) {
                parent_entry.remove_sub_entry(path);
            }
            self.prune(&parent);
        }
    }

    fn remove_delayed(&mut self) {
        let queued = std::mem::take(&mut self.removal_queue);
        for path in queued {
            if self.entries.get(&path).is_some_and(|entry| !entry.is_valid()) {
                self.destroy(&path);
            }
        }
    }

    // Backend selection

    fn attach(&mut self, path: &Path) {
        let Some(entry) = self.entries.get_mut(path) else {
            return;
        };
        if entry.token.is_some() || entry.mode == BackendMode::Polling {
            return;
        }

        if entry.status == EntryStatus::NonExistent {
            let Some(parent) = parent_directory(path).map(Path::to_path_buf) else {
                self.use_polling(path);
                return;
            };
            entry.mode = BackendMode::Unknown;
            entry.parent = Some(parent.clone());
            trace!("{:?} does not exist, watching {:?} for it", path, parent);
            self.add_entry(&parent, Link::SubEntry(path.to_path_buf()), true);
            return;
        }

        let is_dir = entry.is_dir;
        let network = self.network.is_network(path);
        let preference =
            if network { self.config.network_preferred_backend } else { self.config.preferred_backend };
        let preferred = preference.mode();

        let mut order = vec![preferred];
        order.extend(BackendMode::EVENT_PRECEDENCE.iter().copied().filter(|mode| *mode != preferred));

        for mode in order {
            if mode == BackendMode::Polling {
                break;
            }
            let Some(backend) = self.backends.get_mut(mode) else {
                continue;
            };
            if !backend.supports(is_dir) {
                continue;
            }

            let token = WatchToken(self.next_token);
            self.next_token += 1;
            match backend.attach(path, is_dir, token) {
                Ok(()) => {
                    self.descriptors.insert(token, path.to_path_buf());
                    if let Some(entry) = self.entries.get_mut(path) {
                        entry.mode = mode;
                        entry.token = Some(token);
                    }
                    debug!("Attached {:?} to {}", path, mode);
                    return;
                }
                Err(e @ BackendError::Exhausted { .. }) => {
                    warn!("{}; polling {:?} instead", e, path);
                    break;
                }
                Err(e) => warn!("{}; trying the next mechanism", e),
            }
        }

        self.use_polling(path);
    }

    fn use_polling(&mut self, path: &Path) {
        let interval = if self.network.is_network(path) {
            self.config.network_poll_interval_ms
        } else {
            self.config.poll_interval_ms
        };
        let Some(entry) = self.entries.get_mut(path) else {
            return;
        };
        entry.mode = BackendMode::Polling;
        entry.poll_interval_ms = interval;
        entry.poll_remaining_ms = i64::try_from(interval).unwrap_or(i64::MAX);
        debug!("Polling {:?} every {}ms", path, interval);
        self.update_poll_period();
        self.baseline_children(path);
    }

    /// Release whatever serves the entry; a no-op when nothing does
    fn detach(&mut self, path: &Path) {
        let Some(entry) = self.entries.get_mut(path) else {
            return;
        };
        if let Some(token) = entry.token.take() {
            if let Some(backend) = self.backends.get_mut(entry.mode) {
                backend.detach(token);
            }
            self.descriptors.remove(&token);
            debug!("Detached {:?} from {}", path, entry.mode);
        }

        let was_polling = entry.mode == BackendMode::Polling;
        entry.mode = BackendMode::Unknown;
        entry.children = None;
        if was_polling {
            self.update_poll_period();
        }
    }

    fn update_poll_period(&mut self) {
        let period = self.entries.values().filter(|e| e.mode == BackendMode::Polling).map(|e| e.poll_interval_ms).min();
        if period != self.poll_period_ms {
            match period {
                Some(ms) => debug!("Global poll period is now {}ms", ms),
                None => debug!("No entries polled, timer idle"),
            }
            self.poll_period_ms = period;
        }
    }

    // Backend events

    fn handle_backend_event(&mut self, event: BackendEvent) {
        let Some(token) = event.token else {
            debug!("Backend lost events, rescanning everything");
            self.rescan_all();
            return;
        };
        // Late events for released watches are expected after removal
        let Some(path) = self.descriptors.get(&token).cloned() else {
            trace!("Dropping event for released watch {:?}", token);
            return;
        };
        self.rescan_requested = true;

        match event.kind {
            BackendEventKind::Modified => {
                if let Some(entry) = self.entries.get_mut(&path) {
                    entry.dirty = true;
                    entry.forced_change = true;
                }
            }
            BackendEventKind::Deleted => {
                // The native watch died with the path
                self.detach(&path);
                if let Some(entry) = self.entries.get_mut(&path) {
                    entry.dirty = true;
                }
            }
            BackendEventKind::ChildCreated(name) => self.child_event(&path, &name, true),
            BackendEventKind::ChildDeleted(name) => self.child_event(&path, &name, true),
            BackendEventKind::ChildModified(name) => self.child_event(&path, &name, false),
            BackendEventKind::Rescan => self.rescan_all(),
        }
    }

    fn child_event(&mut self, dir: &Path, name: &str, listing_changed: bool) {
        let child = dir.join(name);

        // A watched path is reported even when its name is noisy
        let waiting = self.entries.get(dir).is_some_and(|entry| entry.sub_entries.contains(&child));
        if waiting && let Some(child_entry) = self.entries.get_mut(&child) {
            child_entry.dirty = true;
        }

        if self.noise.is_noisy(name) {
            trace!("Ignoring noisy {:?} in {:?}", name, dir);
            return;
        }

        let child_type = match self.entries.get(&child) {
            Some(child_entry) if child_entry.status == EntryStatus::Normal => Some(child_entry.is_dir),
            _ => probe_path(self.probe.as_ref(), &child).map(|meta| meta.is_dir),
        };

        let Some(entry) = self.entries.get_mut(dir) else {
            return;
        };
        if listing_changed {
            entry.dirty = true;
            entry.forced_change = true;
        }
        if entry.wants_contents() {
            entry.pending_content.record(child_type);
        }
    }

    // Scan and dispatch

    fn scan(&mut self, elapsed_ms: i64) {
        self.rescan_requested = false;
        self.scanning = true;

        if std::mem::take(&mut self.rescan_all) {
            for entry in self.entries.values_mut() {
                entry.dirty = true;
            }
        } else {
            self.propagate_dirty();
        }

        // Parents sort before their children, so an ancestor promoted here
        // is followed by its waiting descendants in the same pass
        let paths: Vec<PathBuf> = self.entries.keys().cloned().collect();
        let mut outcomes: BTreeMap<PathBuf, Outcome> = BTreeMap::new();
        for path in &paths {
            let outcome = self.scan_entry(path, elapsed_ms);
            if !outcome.mask.is_empty() || !outcome.content.is_empty() {
                outcomes.insert(path.clone(), outcome);
            }
        }

        // A change to a path counts as a content change of its parent directory
        let cascades: Vec<(PathBuf, bool)> = outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.mask.is_empty())
            .filter_map(|(path, _)| {
                let parent = parent_directory(path)?;
                let is_dir = self.entries.get(path).is_some_and(|e| e.is_dir);
                Some((parent.to_path_buf(), is_dir))
            })
            .collect();
        for (parent, is_dir) in cascades {
            let interested = self
                .entries
                .get(&parent)
                .is_some_and(|p| p.status == EntryStatus::Normal && p.wants_contents());
            if interested {
                outcomes.entry(parent).or_default().content.record(Some(is_dir));
            }
        }

        for (path, outcome) in outcomes {
            self.emit(&path, outcome);
        }

        self.scanning = false;
        self.remove_delayed();
    }

    /// Mark nested entries of dirty event-driven entries dirty as well
    fn propagate_dirty(&mut self) {
        let mut stack: Vec<PathBuf> = self
            .entries
            .values()
            .filter(|e| e.dirty && e.mode.is_event_driven())
            .flat_map(|e| e.sub_entries.iter().cloned())
            .collect();

        let mut seen = BTreeSet::new();
        while let Some(path) = stack.pop() {
            if !seen.insert(path.clone()) {
                continue;
            }
            if let Some(entry) = self.entries.get_mut(&path) {
                entry.dirty = true;
                stack.extend(entry.sub_entries.iter().cloned());
            }
        }
    }

    fn scan_entry(&mut self, path: &Path, elapsed_ms: i64) -> Outcome {
        let Some(entry) = self.entries.get_mut(path) else {
            return Outcome::default();
        };
        // Awaiting delayed removal
        if !entry.is_valid() {
            return Outcome::default();
        }

        match entry.mode {
            BackendMode::Polling => {
                entry.poll_remaining_ms -= elapsed_ms;
                if entry.poll_remaining_ms > 0 && !entry.dirty {
                    return Outcome::default();
                }
                if entry.poll_remaining_ms <= 0 {
                    let interval = i64::try_from(entry.poll_interval_ms).unwrap_or(i64::MAX);
                    entry.poll_remaining_ms += interval;
                    if entry.poll_remaining_ms <= 0 {
                        entry.poll_remaining_ms = interval;
                    }
                }
            }
            BackendMode::Unknown => {
                if !entry.dirty {
                    return Outcome::default();
                }
            }
            _ => {
                if !entry.dirty && entry.pending_content.is_empty() && entry.token.is_some() {
                    return Outcome::default();
                }
            }
        }

        entry.dirty = false;
        let forced = std::mem::take(&mut entry.forced_change);
        let mut content = std::mem::take(&mut entry.pending_content);

        let meta = probe_path(self.probe.as_ref(), path);
        let mut transition = classify(entry.status, entry.is_dir, entry.snapshot, meta.as_ref());
        // A backend report wins over an unchanged stat
        if transition == Transition::NoChange && forced && entry.status == EntryStatus::Normal && meta.is_some() {
            transition = Transition::Changed;
        }

        let type_changed = meta.is_some_and(|m| m.is_dir != entry.is_dir);
        match &meta {
            Some(meta) => {
                entry.snapshot = Some(Snapshot::from(meta));
                entry.is_dir = meta.is_dir;
                entry.status = EntryStatus::Normal;
            }
            None => {
                entry.snapshot = None;
                entry.status = EntryStatus::NonExistent;
            }
        }

        let mut mask = transition.mask();
        match transition {
            Transition::Created => self.promote(path),
            Transition::Deleted => {
                content = ContentChanges::default();
                self.demote(path);
            }
            Transition::Changed if type_changed => {
                debug!("{:?} changed type, re-attaching", path);
                self.detach(path);
                self.attach(path);
            }
            _ => {}
        }

        // A native watch lost to a replaced path is re-established
        if self.entries.get(path).is_some_and(|e| {
            e.status == EntryStatus::Normal && e.token.is_none() && e.mode != BackendMode::Polling
        }) {
            self.detach(path);
            self.attach(path);
        }

        if let Some(diff) = self.enumerate_children(path) {
            if diff.listing_changed && transition == Transition::NoChange {
                mask |= EventMask::CHANGED;
            }
            content.merge(diff.content);
        }

        if !mask.is_empty() {
            trace!("{:?}: {:?}", path, transition);
        }
        Outcome { mask, content }
    }

    /// Re-read a polled directory's children. Sub-entries that appeared are
    /// marked for examination later in the same pass.
    fn enumerate_children(&mut self, path: &Path) -> Option<crate::scan::ChildDiff> {
        let entry = self.entries.get(path)?;
        if entry.mode != BackendMode::Polling || entry.status != EntryStatus::Normal || !entry.is_dir {
            return None;
        }

        let names = match self.probe.read_dir(path) {
            Ok(names) => names,
            Err(e) => {
                debug!("{}", e);
                return None;
            }
        };

        // Waiting sub-entries are matched against the unfiltered names
        let appeared: Vec<PathBuf> = entry
            .sub_entries
            .iter()
            .filter(|sub| sub.file_name().is_some_and(|name| names.iter().any(|n| name == n.as_str())))
            .cloned()
            .collect();

        let listing = self.read_listing(path, names);
        let entry = self.entries.get_mut(path)?;
        let diff = diff_children(entry.children.as_ref(), &listing);
        entry.children = Some(listing);

        for sub in appeared {
            if let Some(sub_entry) = self.entries.get_mut(&sub) {
                sub_entry.dirty = true;
            }
        }
        Some(diff)
    }

    /// Stamp every non-noisy name of a directory listing
    fn read_listing(&self, dir: &Path, names: Vec<String>) -> BTreeMap<String, ChildStamp> {
        let mut listing = BTreeMap::new();
        for name in names {
            if self.noise.is_noisy(&name) {
                continue;
            }
            if let Some(meta) = probe_path(self.probe.as_ref(), &dir.join(&name)) {
                listing.insert(name, ChildStamp { modified: meta.modified, is_dir: meta.is_dir });
            }
        }
        listing
    }

    /// First listing of a directory that starts polling, so changes to
    /// existing children are seen from the first interval on
    fn baseline_children(&mut self, path: &Path) {
        let Some(entry) = self.entries.get(path) else {
            return;
        };
        if entry.status != EntryStatus::Normal || !entry.is_dir || entry.children.is_some() {
            return;
        }
        let names = match self.probe.read_dir(path) {
            Ok(names) => names,
            Err(e) => {
                debug!("{}", e);
                return;
            }
        };
        let listing = self.read_listing(path, names);
        if let Some(entry) = self.entries.get_mut(path) {
            entry.children = Some(listing);
        }
    }

    /// A waited-for path now exists: watch it directly and stop nesting it
    fn promote(&mut self, path: &Path) {
        let Some(entry) = self.entries.get_mut(path) else {
            return;
        };
        let parent = entry.parent.take();
        let subs = entry.sub_entries.clone();
        debug!("{:?} appeared", path);

        self.attach(path);

        // Descendants may have been created before this watch existed
        for sub in subs {
            if probe_path(self.probe.as_ref(), &sub).is_some()
                && let Some(sub_entry) = self.entries.get_mut(&sub)
            {
                sub_entry.dirty = true;
            }
        }

        if let Some(parent) = parent {
            if let Some(parent_entry) = self.entries.get_mut(&parent) {
                parent_entry.remove_sub_entry(path);
            }
            self.prune(&parent);
        }
    }

    /// A watched path went away: release its watch and wait for it under its parent
    fn demote(&mut self, path: &Path) {
        debug!("{:?} vanished", path);
        self.detach(path);
        self.attach(path);
    }

    fn emit(&mut self, path: &Path, outcome: Outcome) {
        let Some(entry) = self.entries.get_mut(path) else {
            return;
        };
        let is_dir = entry.is_dir;

        let mut deliveries = Vec::new();
        for client in &mut entry.clients {
            let mut event = outcome.mask;
            if outcome.content.interests(client.modes) {
                event |= EventMask::CHANGED;
            }
            if event.is_empty() {
                continue;
            }
            if client.paused {
                client.accrue(event);
                continue;
            }
            if let Some(kind) = event.strongest() {
                deliveries.push((client.subscriber, kind));
            }
        }

        for (subscriber, kind) in deliveries {
            self.deliver(subscriber, WatchEvent::new(path, kind, is_dir));
        }
    }

    fn deliver(&self, subscriber: SubscriberId, event: WatchEvent) {
        let Some(tx) = self.subscribers.get(&subscriber) else {
            return;
        };
        trace!("{} {:?} -> {}", event.kind, event.path, subscriber);
        if tx.send(event).is_err() {
            debug!("Subscriber {} dropped its receiver", subscriber);
        }
    }
}

impl Drop for DirWatchEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DirWatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirWatchEngine")
            .field("entries", &self.entries.len())
            .field("backends", &self.backends.modes())
            .field("poll_period_ms", &self.poll_period_ms)
            .finish()
    }
}

fn invalid(subscription: &Subscription) -> WatchError {
    WatchError::InvalidSubscription { subscriber: subscription.subscriber, path: subscription.path.clone() }
}

fn kind_name(is_dir: bool) -> &'static str {
    if is_dir { "directory" } else { "file" }
}

/// Probe a path; failures read as "does not exist"
fn probe_path(probe: &dyn MetadataProbe, path: &Path) -> Option<Metadata> {
    match probe.read_metadata(path) {
        Ok(meta) => meta,
        Err(e) => {
            debug!("{}", e);
            None
        }
    }
}
