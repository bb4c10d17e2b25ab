//! Lifecycle of the watch, debounce and reload pipeline.

use std::sync::Arc;

use camino::Utf8Path;
use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;
use trafficsync_core::{DetectionStore, SnapshotParser, StoreError};

use crate::config::SyncConfig;
use crate::ingest::{IngestError, IngestOutcome, IngestStatus, Ingestor};
use crate::scheduler::{DebounceScheduler, SchedulerError, SyncJob};
use crate::watcher::{ChangeSink, DirectoryWatcher, WatchError};

/// Errors returned by [`SyncService`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// The scheduler rejected or failed the work.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    /// The watcher could not be started.
    #[error(transparent)]
    Watch(#[from] WatchError),
    /// An ingest run failed.
    #[error(transparent)]
    Ingest(#[from] IngestError),
    /// A maintenance operation on the store failed.
    #[error("failed to {operation}: {source}")]
    Store {
        /// Store operation that failed.
        operation: &'static str,
        /// Store failure.
        #[source]
        source: StoreError,
    },
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Whether the directory watch is registered.
    pub watching: bool,
    /// Number of paths with an armed or running reload.
    pub pending_paths: usize,
    /// Whether the scheduler still accepts work.
    pub executor_active: bool,
}

/// Owns the watcher, scheduler and ingestor for one snapshot file.
///
/// ```no_run
/// use std::sync::Arc;
/// use trafficsync_core::{JsonSnapshotParser, SqliteDetectionStore};
/// use trafficsync_ingest::{SyncConfig, SyncService};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(SqliteDetectionStore::open("detections.db")?);
/// let service = SyncService::new(
///     SyncConfig::new("/var/lib/traffic"),
///     store,
///     Arc::new(JsonSnapshotParser),
/// )?;
/// service.start()?;
/// // ...
/// service.stop();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SyncService {
    config: SyncConfig,
    ingestor: Arc<Ingestor>,
    scheduler: Arc<DebounceScheduler>,
    watcher: DirectoryWatcher,
}

impl SyncService {
    /// Wire the pipeline for `config` on top of `store` and `parser`.
    ///
    /// Nothing runs until [`SyncService::start`] is called, apart from the
    /// scheduler's idle runtime.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn DetectionStore>,
        parser: Arc<dyn SnapshotParser>,
    ) -> Result<Self, SyncError> {
        let ingestor = Arc::new(Ingestor::new(store, parser, config.batch_size));
        let job: Arc<dyn SyncJob> = ingestor.clone();
        let scheduler = Arc::new(DebounceScheduler::new(job, config.scheduler())?);
        let sink: Arc<dyn ChangeSink> = scheduler.clone();
        let watcher = DirectoryWatcher::new(
            config.directory.clone(),
            config.file_name.clone(),
            config.poll_interval,
            sink,
        );
        Ok(Self {
            config,
            ingestor,
            scheduler,
            watcher,
        })
    }

    /// Configuration the service was built with.
    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Start watching for changes, then load the snapshot once if present.
    ///
    /// The watch is registered before the initial load, so a rewrite that
    /// lands while the load runs still schedules a reload. A failed initial
    /// load is logged and does not prevent watching. A watcher that cannot
    /// be registered does not prevent the initial load; its error is
    /// returned afterwards.
    pub fn start(&self) -> Result<(), SyncError> {
        let watching = self.watcher.start();
        if let Err(err) = &watching {
            error!("snapshot changes will not be followed: {err}");
        }

        let path = self.config.snapshot_path();
        if path.is_file() {
            match self.scheduler.force_now(&path) {
                Ok(outcome) => info!(
                    "initial load finished: status = {:?}, store_count = {}",
                    outcome.status, outcome.store_count
                ),
                Err(err) => error!("initial load failed: path = {path}, error = {err}"),
            }
        } else {
            info!("no snapshot yet, waiting for changes: path = {path}");
        }
        watching.map_err(SyncError::from)
    }

    /// Stop watching and shut the scheduler down.
    ///
    /// After `stop` the service rejects triggers; build a new one to resume.
    pub fn stop(&self) {
        self.watcher.stop();
        self.scheduler.shutdown();
    }

    /// Ingest `path`, or the configured snapshot, right away.
    ///
    /// Waits for any in-flight reload. Errors are returned, not retried.
    pub fn trigger_sync(&self, path: Option<&Utf8Path>) -> Result<IngestOutcome, SyncError> {
        let outcome = match path {
            Some(path) => self.scheduler.force_now(path)?,
            None => self.scheduler.force_now(&self.config.snapshot_path())?,
        };
        Ok(outcome)
    }

    /// Current state of the pipeline.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            watching: self.watcher.is_watching(),
            pending_paths: self.scheduler.pending_paths().len(),
            executor_active: self.scheduler.is_active(),
        }
    }

    /// Empty the store and reload the configured snapshot.
    ///
    /// Unlike a regular sync, a missing or empty snapshot leaves the store
    /// empty.
    pub fn force_reload(&self) -> Result<IngestOutcome, SyncError> {
        let ingestor = Arc::clone(&self.ingestor);
        let path = self.config.snapshot_path();
        let outcome = self.scheduler.run_exclusive(move || {
            let deleted = ingestor
                .store()
                .delete_all()
                .map_err(|source| SyncError::Store {
                    operation: "clear detections",
                    source,
                })?;
            info!("store cleared for forced reload: deleted = {deleted}");
            ingestor.ingest(&path).map_err(SyncError::from)
        })??;
        if outcome.status != IngestStatus::Replaced {
            warn!("forced reload found no data: status = {:?}", outcome.status);
        }
        self.verify_integrity()?;
        Ok(outcome)
    }

    /// Delete every record, returning how many were removed.
    pub fn clear_store(&self) -> Result<u64, SyncError> {
        let store = Arc::clone(self.ingestor.store());
        self.scheduler
            .run_exclusive(move || -> Result<u64, StoreError> {
                let before = store.count()?;
                let deleted = store.delete_all()?;
                let after = store.count()?;
                info!("store cleared: before = {before}, deleted = {deleted}, after = {after}");
                Ok(deleted)
            })?
            .map_err(|source| SyncError::Store {
                operation: "clear detections",
                source,
            })
    }

    /// Current record count; an empty store is logged as a warning.
    pub fn verify_integrity(&self) -> Result<u64, SyncError> {
        let count = self
            .ingestor
            .store()
            .count()
            .map_err(|source| SyncError::Store {
                operation: "count detections",
                source,
            })?;
        if count == 0 {
            warn!("store holds no detections");
        } else {
            info!("store holds detections: count = {count}");
        }
        Ok(count)
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.stop();
    }
}
