//! Bounded-poll directory watcher for the snapshot file.
//!
//! Registration happens on the caller's thread inside `start`. The watch
//! loop then runs on a dedicated thread and waits on the `notify` channel for
//! at most one poll interval at a time, so `stop` takes effect within one
//! interval without interrupting the thread.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;

use crate::scheduler::DebounceScheduler;

type EventReceiver = Receiver<notify::Result<Event>>;

/// Kind of change observed for the snapshot file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The file appeared.
    Created,
    /// The file was written, truncated or renamed into place.
    Modified,
}

/// A relevant change of the snapshot file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeEvent {
    /// Path reported by the watch backend.
    pub path: Utf8PathBuf,
    /// What happened.
    pub kind: ChangeKind,
    /// When the watcher saw the event.
    pub observed_at: Instant,
}

/// Consumer of [`FileChangeEvent`]s.
pub trait ChangeSink: Send + Sync + 'static {
    /// Handle one change; called on the watcher thread.
    fn on_change(&self, event: FileChangeEvent);
}

impl ChangeSink for DebounceScheduler {
    fn on_change(&self, event: FileChangeEvent) {
        debug!(
            "snapshot change observed: path = {}, kind = {:?}",
            event.path, event.kind
        );
        if let Err(err) = self.schedule(event.path) {
            warn!("dropping change event: {err}");
        }
    }
}

/// Errors that end the watch loop.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The watched directory could not be created.
    #[error("failed to create watch directory {path}: {source}")]
    CreateDirectory {
        /// Directory that was to be watched.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The watch backend refused the registration.
    #[error("failed to watch {path}: {source}")]
    Register {
        /// Directory that was to be watched.
        path: Utf8PathBuf,
        /// Backend error.
        #[source]
        source: notify::Error,
    },
    /// The watcher thread could not be spawned.
    #[error("failed to spawn watcher thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Watches one directory for changes to one file name.
pub struct DirectoryWatcher {
    directory: Utf8PathBuf,
    file_name: String,
    poll_interval: Duration,
    sink: Arc<dyn ChangeSink>,
    stop: Arc<AtomicBool>,
    watching: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("directory", &self.directory)
            .field("file_name", &self.file_name)
            .field("watching", &self.is_watching())
            .finish_non_exhaustive()
    }
}

impl DirectoryWatcher {
    /// Create a watcher forwarding changes of `directory/file_name` to `sink`.
    #[must_use]
    pub fn new(
        directory: Utf8PathBuf,
        file_name: String,
        poll_interval: Duration,
        sink: Arc<dyn ChangeSink>,
    ) -> Self {
        Self {
            directory,
            file_name,
            poll_interval,
            sink,
            stop: Arc::new(AtomicBool::new(false)),
            watching: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Register the directory watch and start the loop on a background thread.
    ///
    /// The directory is created and the watch registered before this
    /// returns, so changes made right after a successful `start` are seen.
    /// Does nothing while a loop is already running. A loop that ended on its
    /// own, for example because the backend channel closed, is replaced by a
    /// fresh one.
    ///
    /// # Errors
    /// Returns [`WatchError`] when the directory cannot be created, the watch
    /// cannot be registered or the thread cannot be spawned. The watcher is
    /// then left idle and `start` may be called again.
    pub fn start(&self) -> Result<(), WatchError> {
        let mut thread = self.thread();
        if thread.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("watcher already running: directory = {}", self.directory);
            return Ok(());
        }
        if let Some(finished) = thread.take() {
            join_watch_thread(finished);
        }

        let (watcher, events) = self.register()?;
        self.stop.store(false, Ordering::SeqCst);
        self.watching.store(true, Ordering::SeqCst);
        let watch_loop = WatchLoop {
            _watcher: watcher,
            events,
            directory: self.directory.clone(),
            file_name: self.file_name.clone(),
            poll_interval: self.poll_interval,
            sink: Arc::clone(&self.sink),
            stop: Arc::clone(&self.stop),
            watching: Arc::clone(&self.watching),
        };
        let spawned = thread::Builder::new()
            .name("trafficsync-watcher".to_owned())
            .spawn(move || watch_loop.run());
        match spawned {
            Ok(handle) => {
                *thread = Some(handle);
                info!(
                    "watching for snapshot changes: directory = {}, file = {}",
                    self.directory, self.file_name
                );
                Ok(())
            }
            Err(source) => {
                self.watching.store(false, Ordering::SeqCst);
                Err(WatchError::Spawn(source))
            }
        }
    }

    fn register(&self) -> Result<(RecommendedWatcher, EventReceiver), WatchError> {
        trafficsync_fs::ensure_dir(&self.directory).map_err(|source| {
            WatchError::CreateDirectory {
                path: self.directory.clone(),
                source,
            }
        })?;

        let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(event_tx).map_err(|source| self.register_error(source))?;
        watcher
            .watch(self.directory.as_std_path(), RecursiveMode::NonRecursive)
            .map_err(|source| self.register_error(source))?;
        Ok((watcher, event_rx))
    }

    fn register_error(&self, source: notify::Error) -> WatchError {
        WatchError::Register {
            path: self.directory.clone(),
            source,
        }
    }

    /// Ask the loop to stop and wait for the thread to exit.
    ///
    /// Returns within about one poll interval.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self.thread().take();
        if let Some(handle) = handle {
            join_watch_thread(handle);
            info!("watcher stopped: directory = {}", self.directory);
        }
    }

    /// Whether the watch registration is live.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    fn thread(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.thread.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_watch_thread(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!("watcher thread panicked");
    }
}

struct WatchLoop {
    _watcher: RecommendedWatcher,
    events: EventReceiver,
    directory: Utf8PathBuf,
    file_name: String,
    poll_interval: Duration,
    sink: Arc<dyn ChangeSink>,
    stop: Arc<AtomicBool>,
    watching: Arc<AtomicBool>,
}

impl WatchLoop {
    fn run(self) {
        while !self.stop.load(Ordering::SeqCst) {
            match self.events.recv_timeout(self.poll_interval) {
                Ok(Ok(event)) => self.dispatch(&event),
                Ok(Err(err)) => warn!("watch backend error: {err}"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    error!("watch channel closed: directory = {}", self.directory);
                    break;
                }
            }
        }
        self.watching.store(false, Ordering::SeqCst);
    }

    fn dispatch(&self, event: &Event) {
        if event.need_rescan() {
            debug!("discarding overflow event: directory = {}", self.directory);
            return;
        }
        let Some(kind) = classify(&event.kind) else {
            return;
        };
        for path in &event.paths {
            let Some(path) = Utf8Path::from_path(path) else {
                continue;
            };
            if path.file_name() == Some(self.file_name.as_str()) {
                self.sink.on_change(FileChangeEvent {
                    path: path.to_owned(),
                    kind,
                    observed_at: Instant::now(),
                });
            }
        }
    }
}

const fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        _ => None,
    }
}
