//! Core functionality for dirwatch
//!
//! A process-wide file and directory change notification engine. Many
//! subscribers register interest in paths (which need not exist yet); the
//! engine keeps one entry per path, serves it with the best notification
//! mechanism available and reports `Created`, `Deleted` and `Changed` events.
//!
//! ```no_run
//! use dirwatch_core::{DirWatchEngine, WatchConfig, WatchKind, WatchModes, WatchService};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let engine = DirWatchEngine::new(WatchConfig::default())?;
//! let service = WatchService::spawn(engine);
//! let handle = service.handle();
//!
//! let (id, mut events) = handle.subscribe().await?;
//! handle.add_watch(id, "/tmp/report.txt", WatchKind::File, WatchModes::DIR_ONLY).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{} {:?}", event.kind, event.path);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod event;
pub mod probe;
mod scan;
pub mod service;

#[cfg(test)]
mod testing;

pub use backend::{BackendEvent, BackendEventKind, BackendMode, BackendSender, NativeBackend, WatchToken};
pub use config::{BackendPreference, WatchConfig};
pub use engine::{DirWatchEngine, EngineStats};
pub use entry::{EntryStatus, WatchModes};
pub use error::{BackendError, ProbeError, WatchError, WatchResult};
pub use event::{EventKind, EventReceiver, SubscriberId, Subscription, WatchEvent, WatchKind};
pub use probe::{FsProbe, Metadata, MetadataProbe};
pub use service::{WatchHandle, WatchService};
