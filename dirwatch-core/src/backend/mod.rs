//! Native notification backends
//!
//! A backend owns the OS-level watch resources (kernel watch descriptors,
//! daemon request handles). The engine hands each attached entry a unique
//! [`WatchToken`] and the backend reports activity for that token through a
//! [`BackendSender`]. Callbacks may fire on any thread; they only ever push
//! onto the queue, and the engine drains it on its owning task.

pub mod native;

pub use native::NotifyBackend;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tracing::trace;

use crate::error::BackendError;

/// Mechanism currently serving an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendMode {
    Unknown,
    Polling,
    KernelEvent,
    DaemonEvent,
    WatcherService,
}

impl BackendMode {
    /// Event-driven mechanisms in fallback order; polling comes after all of them
    pub const EVENT_PRECEDENCE: [BackendMode; 3] =
        [BackendMode::KernelEvent, BackendMode::DaemonEvent, BackendMode::WatcherService];

    pub fn is_event_driven(self) -> bool {
        Self::EVENT_PRECEDENCE.contains(&self)
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendMode::Unknown => "unknown",
            BackendMode::Polling => "polling",
            BackendMode::KernelEvent => "kernel-event",
            BackendMode::DaemonEvent => "daemon-event",
            BackendMode::WatcherService => "watcher-service",
        };
        f.write_str(name)
    }
}

/// Identifier of one attached watch, unique across all backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchToken(pub u64);

/// What a backend observed for a watched path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEventKind {
    /// The watched path itself was modified (content or attributes)
    Modified,
    /// The watched path itself went away; the native watch is dead
    Deleted,
    ChildCreated(String),
    ChildDeleted(String),
    ChildModified(String),
    /// Events were lost; every entry must be re-examined
    Rescan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEvent {
    /// `None` only for [`BackendEventKind::Rescan`]
    pub token: Option<WatchToken>,
    pub kind: BackendEventKind,
}

impl BackendEvent {
    pub fn new(token: WatchToken, kind: BackendEventKind) -> Self {
        Self { token: Some(token), kind }
    }

    pub fn rescan() -> Self {
        Self { token: None, kind: BackendEventKind::Rescan }
    }
}

/// Thread-safe producer side of the backend event queue
#[derive(Debug, Clone)]
pub struct BackendSender {
    tx: mpsc::UnboundedSender<BackendEvent>,
    wake: Arc<Notify>,
}

impl BackendSender {
    /// Queue an event and wake the owning task
    pub fn send(&self, event: BackendEvent) {
        if self.tx.send(event).is_err() {
            trace!("Backend event dropped, engine is gone");
            return;
        }
        self.wake.notify_one();
    }
}

/// Consumer side, owned by the engine
#[derive(Debug)]
pub(crate) struct BackendQueue {
    rx: mpsc::UnboundedReceiver<BackendEvent>,
    sender: BackendSender,
}

impl BackendQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { rx, sender: BackendSender { tx, wake: Arc::new(Notify::new()) } }
    }

    pub(crate) fn sender(&self) -> BackendSender {
        self.sender.clone()
    }

    pub(crate) fn waker(&self) -> Arc<Notify> {
        self.sender.wake.clone()
    }

    pub(crate) fn try_recv(&mut self) -> Option<BackendEvent> {
        self.rx.try_recv().ok()
    }
}

/// A concrete OS notification mechanism.
///
/// Implementations must release the resource behind a token exactly once,
/// on `detach`. The engine never attaches the same token twice and never
/// detaches a token it did not get from a successful `attach`.
pub trait NativeBackend: Send {
    fn mode(&self) -> BackendMode;

    /// Whether this mechanism can watch a path of the given type
    fn supports(&self, _is_dir: bool) -> bool {
        true
    }

    /// Start watching `path`; activity is reported with `token`
    fn attach(&mut self, path: &Path, is_dir: bool, token: WatchToken) -> Result<(), BackendError>;

    /// Stop watching; unknown tokens are ignored
    fn detach(&mut self, token: WatchToken);

    /// Number of native resources currently held
    fn active_watches(&self) -> usize;
}

/// Installed backends keyed by mode
#[derive(Default)]
pub(crate) struct BackendSet {
    backends: Vec<Box<dyn NativeBackend>>,
}

impl BackendSet {
    /// Install a backend, replacing any previous one for the same mode
    pub(crate) fn install(&mut self, backend: Box<dyn NativeBackend>) -> Option<Box<dyn NativeBackend>> {
        let mode = backend.mode();
        let previous = self.backends.iter().position(|b| b.mode() == mode).map(|idx| self.backends.remove(idx));
        self.backends.push(backend);
        previous
    }

    pub(crate) fn get_mut(&mut self, mode: BackendMode) -> Option<&mut Box<dyn NativeBackend>> {
        self.backends.iter_mut().find(|b| b.mode() == mode)
    }

    pub(crate) fn active_watches(&self) -> usize {
        self.backends.iter().map(|b| b.active_watches()).sum()
    }

    pub(crate) fn modes(&self) -> Vec<BackendMode> {
        self.backends.iter().map(|b| b.mode()).collect()
    }
}

/// Install the notification mechanisms this host offers.
///
/// Each one that fails to initialise is skipped; polling needs no backend.
pub(crate) fn host_backends(sender: &BackendSender) -> Vec<Box<dyn NativeBackend>> {
    let mut backends: Vec<Box<dyn NativeBackend>> = Vec::new();

    #[cfg(any(target_os = "linux", target_os = "android"))]
    match NotifyBackend::<notify::INotifyWatcher>::new(BackendMode::KernelEvent, sender.clone()) {
        Ok(backend) => backends.push(Box::new(backend)),
        Err(e) => tracing::warn!("Kernel notification unavailable: {}", e),
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    match NotifyBackend::<notify::RecommendedWatcher>::new(BackendMode::WatcherService, sender.clone()) {
        Ok(backend) => backends.push(Box::new(backend)),
        Err(e) => tracing::warn!("Native watch service unavailable: {}", e),
    }

    backends
}
