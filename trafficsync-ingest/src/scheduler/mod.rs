//! Debounced, serialised execution of ingest runs.
//!
//! Writers rarely replace a snapshot in one step: a truncate followed by
//! several appends raises a burst of change notifications. The scheduler
//! turns each burst into one run that starts once the path has been quiet for
//! the configured window.
//!
//! Every run, whether debounced, forced or retried, holds the single permit
//! of the scheduler's gate while it executes on the runtime's blocking pool,
//! so runs never overlap.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tokio::sync::Semaphore;
use tokio::task::JoinError;

use crate::config::{DEFAULT_QUIET_WINDOW, DEFAULT_SHUTDOWN_GRACE};
use crate::ingest::{IngestError, IngestOutcome, Ingestor};
use crate::retry::{RetryPolicy, is_retryable};

/// Work the scheduler runs for a path.
pub trait SyncJob: Send + Sync + 'static {
    /// Synchronise the store from the snapshot at `path`.
    fn run(&self, path: &Utf8Path) -> Result<IngestOutcome, IngestError>;
}

impl SyncJob for Ingestor {
    fn run(&self, path: &Utf8Path) -> Result<IngestOutcome, IngestError> {
        self.ingest(path)
    }
}

/// Timing settings for a [`DebounceScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Quiet period that must follow the last event before a run.
    pub quiet_window: Duration,
    /// Retry behaviour for transient failures of debounced runs.
    pub retry: RetryPolicy,
    /// Time an in-flight run is given to finish at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quiet_window: DEFAULT_QUIET_WINDOW,
            retry: RetryPolicy::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Errors returned by [`DebounceScheduler`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The Tokio runtime could not be built.
    #[error("failed to build scheduler runtime: {0}")]
    Runtime(#[source] io::Error),
    /// The scheduler no longer accepts work.
    #[error("scheduler is shut down")]
    ShutDown,
    /// The run itself failed.
    #[error(transparent)]
    Ingest(#[from] IngestError),
    /// The run panicked or was cancelled.
    #[error("sync task did not complete: {0}")]
    Join(#[source] JoinError),
}

impl SchedulerError {
    /// Whether the failure is a transient ingest error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Ingest(err) if is_retryable(err))
    }
}

/// Latest event seen for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingTask {
    last_event_at: Instant,
    token: u64,
}

struct Shared {
    job: Arc<dyn SyncJob>,
    config: SchedulerConfig,
    pending: Mutex<HashMap<Utf8PathBuf, PendingTask>>,
    gate: Semaphore,
    next_token: AtomicU64,
    accepting: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<Utf8PathBuf, PendingTask>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_task(&self, path: &Utf8Path, token: u64) -> Option<PendingTask> {
        self.pending()
            .get(path)
            .copied()
            .filter(|task| task.token == token)
    }

    fn clear_if_current(&self, path: &Utf8Path, token: u64) {
        let mut pending = self.pending();
        if pending.get(path).is_some_and(|task| task.token == token) {
            pending.remove(path);
        }
    }

    async fn run_exclusive<T, F>(&self, task: F) -> Result<T, SchedulerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| SchedulerError::ShutDown)?;
        tokio::task::spawn_blocking(task)
            .await
            .map_err(SchedulerError::Join)
    }

    async fn run_job(&self, path: &Utf8Path) -> Result<IngestOutcome, SchedulerError> {
        let job = Arc::clone(&self.job);
        let target = path.to_owned();
        self.run_exclusive(move || job.run(&target))
            .await?
            .map_err(SchedulerError::from)
    }

    /// Delayed task armed by `schedule`.
    async fn fire(self: Arc<Self>, path: Utf8PathBuf, token: u64) {
        tokio::time::sleep(self.config.quiet_window).await;
        let Some(task) = self.current_task(&path, token) else {
            debug!("discarding superseded sync: path = {path}, token = {token}");
            return;
        };
        debug!(
            "quiet window elapsed: path = {path}, idle_for = {:?}",
            task.last_event_at.elapsed()
        );

        let mut retries = 0;
        loop {
            match self.run_job(&path).await {
                Ok(outcome) => {
                    debug!("sync finished: path = {path}, status = {:?}", outcome.status);
                    break;
                }
                Err(err) if err.is_retryable() && self.config.retry.allows(retries) => {
                    retries += 1;
                    warn!(
                        "transient sync failure, retrying: path = {path}, retry = {retries}, backoff = {:?}, error = {err}",
                        self.config.retry.backoff
                    );
                    tokio::time::sleep(self.config.retry.backoff).await;
                    if self.current_task(&path, token).is_none() {
                        debug!("retry superseded by a newer change: path = {path}");
                        return;
                    }
                }
                Err(err) if err.is_retryable() => {
                    error!("giving up on sync: path = {path}, retries = {retries}, error = {err}");
                    break;
                }
                Err(err) => {
                    error!("sync failed: path = {path}, error = {err}");
                    break;
                }
            }
        }
        self.clear_if_current(&path, token);
    }
}

/// Coalesces change notifications into delayed, serialised ingest runs.
///
/// The scheduler owns a Tokio runtime with one worker thread for its delay
/// timers. Dropping it performs [`DebounceScheduler::shutdown`]. Both the
/// blocking entry points and shutdown may be called from synchronous code or
/// from inside another Tokio runtime.
pub struct DebounceScheduler {
    shared: Arc<Shared>,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl fmt::Debug for DebounceScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebounceScheduler")
            .field("config", &self.shared.config)
            .field("pending", &self.shared.pending().len())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl DebounceScheduler {
    /// Create a scheduler that runs `job`.
    pub fn new(job: Arc<dyn SyncJob>, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("trafficsync-scheduler")
            .enable_time()
            .build()
            .map_err(SchedulerError::Runtime)?;
        let handle = runtime.handle().clone();
        let shared = Shared {
            job,
            config,
            pending: Mutex::default(),
            gate: Semaphore::new(1),
            next_token: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
        };
        Ok(Self {
            shared: Arc::new(shared),
            handle,
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Record an event for `path` and arm a run after the quiet window.
    ///
    /// A later call for the same path supersedes this one; only the run armed
    /// by the most recent event executes.
    pub fn schedule(&self, path: Utf8PathBuf) -> Result<(), SchedulerError> {
        self.ensure_accepting()?;
        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
        self.shared.pending().insert(
            path.clone(),
            PendingTask {
                last_event_at: Instant::now(),
                token,
            },
        );
        debug!("sync scheduled: path = {path}, token = {token}");
        drop(self.handle.spawn(Arc::clone(&self.shared).fire(path, token)));
        Ok(())
    }

    /// Run the job for `path` now, bypassing the quiet window.
    ///
    /// The run still waits for any in-flight run to finish. Failures are
    /// returned to the caller and never retried.
    pub fn force_now(&self, path: &Utf8Path) -> Result<IngestOutcome, SchedulerError> {
        self.ensure_accepting()?;
        let shared = Arc::clone(&self.shared);
        let target = path.to_owned();
        self.block_on(async move { shared.run_job(&target).await })
    }

    /// Run `task` on the blocking pool while holding the gate.
    ///
    /// Used for maintenance work that must not overlap an ingest run.
    pub fn run_exclusive<T, F>(&self, task: F) -> Result<T, SchedulerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_accepting()?;
        let shared = Arc::clone(&self.shared);
        self.block_on(async move { shared.run_exclusive(task).await })
    }

    /// Paths with an armed or running task, sorted.
    #[must_use]
    pub fn pending_paths(&self) -> Vec<Utf8PathBuf> {
        let mut paths: Vec<_> = self.shared.pending().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Whether the scheduler still accepts work.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting work, drop armed tasks and wait up to the grace period
    /// for an in-flight run.
    pub fn shutdown(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.gate.close();
        let cancelled = {
            let mut pending = self.shared.pending();
            let count = pending.len();
            pending.clear();
            count
        };
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            shutdown_runtime(runtime, self.shared.config.shutdown_grace);
            info!("scheduler stopped: cancelled = {cancelled}");
        }
    }

    fn ensure_accepting(&self) -> Result<(), SchedulerError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(SchedulerError::ShutDown)
        }
    }

    /// Drive `future` to completion on the scheduler's runtime.
    ///
    /// Outside any runtime the calling thread drives it directly. Inside one,
    /// the future is spawned on the scheduler's runtime and the caller waits
    /// for its result, leaving the worker with `block_in_place` where the
    /// caller's runtime allows it.
    fn block_on<T, F>(&self, future: F) -> Result<T, SchedulerError>
    where
        F: Future<Output = Result<T, SchedulerError>> + Send + 'static,
        T: Send + 'static,
    {
        let Ok(current) = Handle::try_current() else {
            return self.handle.block_on(future);
        };
        let (result_tx, result_rx) = mpsc::sync_channel(1);
        drop(self.handle.spawn(async move {
            if result_tx.send(future.await).is_err() {
                debug!("caller stopped waiting for scheduler result");
            }
        }));
        let received = if current.runtime_flavor() == RuntimeFlavor::MultiThread {
            tokio::task::block_in_place(|| result_rx.recv())
        } else {
            result_rx.recv()
        };
        received.unwrap_or(Err(SchedulerError::ShutDown))
    }
}

/// Shut `runtime` down, waiting up to `grace` for running tasks.
///
/// A runtime cannot be shut down with a timeout from inside an asynchronous
/// context, so there the wait happens on a helper thread.
fn shutdown_runtime(runtime: Runtime, grace: Duration) {
    if Handle::try_current().is_err() {
        runtime.shutdown_timeout(grace);
        return;
    }
    let (runtime_tx, runtime_rx) = mpsc::sync_channel::<Runtime>(1);
    let helper = thread::Builder::new()
        .name("trafficsync-shutdown".to_owned())
        .spawn(move || {
            if let Ok(received) = runtime_rx.recv() {
                received.shutdown_timeout(grace);
            }
        });
    match helper {
        Ok(helper) => {
            if let Err(mpsc::SendError(unsent)) = runtime_tx.send(runtime) {
                unsent.shutdown_background();
            }
            if helper.join().is_err() {
                error!("scheduler shutdown thread panicked");
            }
        }
        Err(err) => {
            warn!("shutting scheduler down without grace period: {err}");
            runtime.shutdown_background();
        }
    }
}

impl Drop for DebounceScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests;
