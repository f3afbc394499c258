//! Async driver for the watch engine
//!
//! The engine runs on one tokio task that owns it outright. Callers talk to
//! it through a cloneable [`WatchHandle`]; backend callbacks wake it through
//! the engine's queue, and a timer drives polling.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::engine::{DirWatchEngine, EngineStats};
use crate::entry::WatchModes;
use crate::error::{WatchError, WatchResult};
use crate::event::{EventReceiver, SubscriberId, Subscription, WatchKind};

enum Command {
    Subscribe(oneshot::Sender<(SubscriberId, EventReceiver)>),
    AddWatch {
        subscriber: SubscriberId,
        path: PathBuf,
        kind: WatchKind,
        modes: WatchModes,
        reply: oneshot::Sender<WatchResult<Subscription>>,
    },
    RemoveWatch(Subscription, oneshot::Sender<WatchResult<()>>),
    RemoveAll(SubscriberId, oneshot::Sender<usize>),
    Stop(Subscription, oneshot::Sender<WatchResult<()>>),
    Start(Subscription, bool, oneshot::Sender<WatchResult<()>>),
    StopAll(SubscriberId, oneshot::Sender<usize>),
    StartAll(SubscriberId, bool, oneshot::Sender<usize>),
    IsPaused(Subscription, oneshot::Sender<WatchResult<bool>>),
    Contains(PathBuf, oneshot::Sender<bool>),
    LastModified(PathBuf, oneshot::Sender<Option<SystemTime>>),
    PollPeriod(oneshot::Sender<Option<Duration>>),
    RescanAll,
    Statistics(oneshot::Sender<EngineStats>),
    Shutdown,
}

/// Running engine task
pub struct WatchService {
    handle: WatchHandle,
    task: JoinHandle<()>,
}

impl WatchService {
    /// Move the engine onto a new task. Must be called inside a tokio runtime.
    pub fn spawn(engine: DirWatchEngine) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(engine, rx));
        info!("Watch service started");
        Self { handle: WatchHandle { tx }, task }
    }

    pub fn handle(&self) -> WatchHandle {
        self.handle.clone()
    }

    /// Stop the task and release every native watch
    pub async fn shutdown(self) {
        let _ = self.handle.tx.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Watch service task failed: {}", e);
        }
    }
}

/// Cloneable client of a [`WatchService`]
#[derive(Clone)]
pub struct WatchHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl WatchHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> WatchResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).map_err(|_| WatchError::ServiceStopped)?;
        rx.await.map_err(|_| WatchError::ServiceStopped)
    }

    pub async fn subscribe(&self) -> WatchResult<(SubscriberId, EventReceiver)> {
        self.request(Command::Subscribe).await
    }

    pub async fn add_watch(
        &self,
        subscriber: SubscriberId,
        path: impl Into<PathBuf>,
        kind: WatchKind,
        modes: WatchModes,
    ) -> WatchResult<Subscription> {
        let path = path.into();
        self.request(|reply| Command::AddWatch { subscriber, path, kind, modes, reply }).await?
    }

    pub async fn remove_watch(&self, subscription: Subscription) -> WatchResult<()> {
        self.request(|reply| Command::RemoveWatch(subscription, reply)).await?
    }

    pub async fn remove_all(&self, subscriber: SubscriberId) -> WatchResult<usize> {
        self.request(|reply| Command::RemoveAll(subscriber, reply)).await
    }

    pub async fn stop(&self, subscription: Subscription) -> WatchResult<()> {
        self.request(|reply| Command::Stop(subscription, reply)).await?
    }

    pub async fn start(&self, subscription: Subscription, replay: bool) -> WatchResult<()> {
        self.request(|reply| Command::Start(subscription, replay, reply)).await?
    }

    pub async fn stop_all(&self, subscriber: SubscriberId) -> WatchResult<usize> {
        self.request(|reply| Command::StopAll(subscriber, reply)).await
    }

    pub async fn start_all(&self, subscriber: SubscriberId, replay: bool) -> WatchResult<usize> {
        self.request(|reply| Command::StartAll(subscriber, replay, reply)).await
    }

    pub async fn is_paused(&self, subscription: Subscription) -> WatchResult<bool> {
        self.request(|reply| Command::IsPaused(subscription, reply)).await?
    }

    pub async fn contains(&self, path: impl Into<PathBuf>) -> WatchResult<bool> {
        let path = path.into();
        self.request(|reply| Command::Contains(path, reply)).await
    }

    pub async fn last_modified(&self, path: impl Into<PathBuf>) -> WatchResult<Option<SystemTime>> {
        let path = path.into();
        self.request(|reply| Command::LastModified(path, reply)).await
    }

    pub async fn poll_period(&self) -> WatchResult<Option<Duration>> {
        self.request(Command::PollPeriod).await
    }

    /// Re-examine every entry now
    pub fn rescan_all(&self) -> WatchResult<()> {
        self.tx.send(Command::RescanAll).map_err(|_| WatchError::ServiceStopped)
    }

    pub async fn statistics(&self) -> WatchResult<EngineStats> {
        self.request(Command::Statistics).await
    }
}

async fn run(mut engine: DirWatchEngine, mut commands: mpsc::UnboundedReceiver<Command>) {
    let waker = engine.waker();
    let coalesce = engine.config().event_coalesce();
    let mut last_tick = Instant::now();
    let mut rescan_at: Option<Instant> = None;

    loop {
        let period = engine.poll_period();
        if period.is_none() {
            last_tick = Instant::now();
        }
        let next_tick = last_tick + period.unwrap_or(Duration::ZERO);

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => handle_command(&mut engine, command),
            },
            _ = waker.notified() => {
                engine.process_backend_events();
                if engine.needs_rescan() && rescan_at.is_none() {
                    rescan_at = Some(Instant::now() + coalesce);
                }
            }
            _ = sleep_until(rescan_at.unwrap_or(next_tick)), if rescan_at.is_some() => {
                rescan_at = None;
                engine.rescan();
            }
            _ = sleep_until(next_tick), if period.is_some() => {
                let now = Instant::now();
                engine.tick(now - last_tick);
                last_tick = now;
            }
        }
    }

    engine.shutdown();
    debug!("Watch service stopped");
}

fn handle_command(engine: &mut DirWatchEngine, command: Command) {
    match command {
        Command::Subscribe(reply) => {
            let _ = reply.send(engine.subscribe());
        }
        Command::AddWatch { subscriber, path, kind, modes, reply } => {
            let _ = reply.send(engine.add_watch(subscriber, path, kind, modes));
        }
        Command::RemoveWatch(subscription, reply) => {
            let _ = reply.send(engine.remove_watch(&subscription));
        }
        Command::RemoveAll(subscriber, reply) => {
            let _ = reply.send(engine.remove_all(subscriber));
        }
        Command::Stop(subscription, reply) => {
            let _ = reply.send(engine.stop(&subscription));
        }
        Command::Start(subscription, replay, reply) => {
            let _ = reply.send(engine.start(&subscription, replay));
        }
        Command::StopAll(subscriber, reply) => {
            let _ = reply.send(engine.stop_all(subscriber));
        }
        Command::StartAll(subscriber, replay, reply) => {
            let _ = reply.send(engine.start_all(subscriber, replay));
        }
        Command::IsPaused(subscription, reply) => {
            let _ = reply.send(engine.is_paused(&subscription));
        }
        Command::Contains(path, reply) => {
            let _ = reply.send(engine.contains(path));
        }
        Command::LastModified(path, reply) => {
            let _ = reply.send(engine.last_modified(path));
        }
        Command::PollPeriod(reply) => {
            let _ = reply.send(engine.poll_period());
        }
        Command::RescanAll => {
            engine.rescan_all();
            engine.rescan();
        }
        Command::Statistics(reply) => {
            let _ = reply.send(engine.statistics());
        }
        // Handled by the loop
        Command::Shutdown => {}
    }
}
