//! Runtime configuration for the synchronisation pipeline.

use std::time::Duration;

use camino::Utf8PathBuf;

use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerConfig;

/// Directory watched when none is configured.
pub const DEFAULT_DIRECTORY: &str = "../detections";
/// Snapshot file name watched when none is configured.
pub const DEFAULT_FILE_NAME: &str = "detections.json";
/// Quiet period that must follow the last change before a reload.
pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_secs(1);
/// Upper bound on one watcher poll, and so on how long `stop` waits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Records inserted per batch.
pub const DEFAULT_BATCH_SIZE: usize = 20;
/// Time an in-flight reload is given to finish during shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Settings for a [`crate::SyncService`].
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use trafficsync_ingest::SyncConfig;
///
/// let config = SyncConfig::new("/var/lib/traffic")
///     .with_quiet_window(Duration::from_millis(250))
///     .with_batch_size(50);
/// assert_eq!(config.snapshot_path(), "/var/lib/traffic/detections.json");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Directory holding the snapshot file.
    pub directory: Utf8PathBuf,
    /// Name of the snapshot file inside `directory`.
    pub file_name: String,
    /// Debounce quiet window.
    pub quiet_window: Duration,
    /// Watcher poll timeout.
    pub poll_interval: Duration,
    /// Insert batch size passed to the store.
    pub batch_size: usize,
    /// Retry behaviour for transient failures.
    pub retry: RetryPolicy,
    /// Grace period for in-flight work at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            directory: Utf8PathBuf::from(DEFAULT_DIRECTORY),
            file_name: DEFAULT_FILE_NAME.to_owned(),
            quiet_window: DEFAULT_QUIET_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl SyncConfig {
    /// Create a configuration watching `directory` with default settings.
    #[must_use]
    pub fn new(directory: impl Into<Utf8PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Set the snapshot file name.
    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    /// Set the debounce quiet window.
    #[must_use]
    pub const fn with_quiet_window(mut self, quiet_window: Duration) -> Self {
        self.quiet_window = quiet_window;
        self
    }

    /// Set the watcher poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the insert batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Full path of the watched snapshot file.
    #[must_use]
    pub fn snapshot_path(&self) -> Utf8PathBuf {
        self.directory.join(&self.file_name)
    }

    /// Scheduler settings derived from this configuration.
    #[must_use]
    pub const fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            quiet_window: self.quiet_window,
            retry: self.retry,
            shutdown_grace: self.shutdown_grace,
        }
    }
}
