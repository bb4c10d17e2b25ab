//! One full-replace synchronisation of the store from the snapshot file.

use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};
use serde::Serialize;
use thiserror::Error;
use trafficsync_core::{DecodeError, DetectionStore, SnapshotParser, StoreError};

mod convert;

/// How an ingest run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// The store contents were replaced from the snapshot.
    Replaced,
    /// The snapshot was absent or not a regular file; the store is untouched.
    MissingFile,
    /// The snapshot held no detections; the store is untouched.
    EmptySnapshot,
}

/// Result of one ingest run, used for verification and logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// How the run ended.
    pub status: IngestStatus,
    /// Entries found in the snapshot, with or without a timestamp.
    pub records_in_file: usize,
    /// Records written to the store.
    pub records_persisted: usize,
    /// Records dropped as invalid plus batches the store rejected.
    pub errors: usize,
    /// Store count after the run.
    pub store_count: u64,
}

impl IngestOutcome {
    /// Whether the store count agrees with the number of persisted records.
    ///
    /// Runs that left the store untouched are always consistent.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.status != IngestStatus::Replaced
            || u64::try_from(self.records_persisted).is_ok_and(|persisted| persisted == self.store_count)
    }
}

/// Errors that abort an ingest run before or during the store replace.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The snapshot could not be read.
    #[error("failed to read snapshot {path}: {source}")]
    Read {
        /// Snapshot location.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The snapshot was not valid.
    #[error("failed to decode snapshot {path}: {source}")]
    Decode {
        /// Snapshot location.
        path: Utf8PathBuf,
        /// Parser failure.
        #[source]
        source: DecodeError,
    },
    /// The store failed.
    #[error("failed to {operation}: {source}")]
    Store {
        /// Store operation that failed.
        operation: &'static str,
        /// Store failure.
        #[source]
        source: StoreError,
    },
}

fn store_error(operation: &'static str) -> impl FnOnce(StoreError) -> IngestError {
    move |source| IngestError::Store { operation, source }
}

/// Replaces the store contents from a snapshot file.
///
/// The ingestor holds no locks of its own; callers must not run two ingests
/// against the same store at once. [`crate::DebounceScheduler`] guarantees
/// that.
///
/// # Examples
/// ```
/// use std::sync::Arc;
/// use camino::Utf8PathBuf;
/// use trafficsync_core::{JsonSnapshotParser, SqliteDetectionStore};
/// use trafficsync_ingest::{IngestStatus, Ingestor};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dir = tempfile::tempdir()?;
/// let path = Utf8PathBuf::from_path_buf(dir.path().join("detections.json"))
///     .map_err(|_| "temp dir is not UTF-8")?;
/// std::fs::write(&path, r#"{"detections":[{"timestamp_ms":1},{"date":"no ts"}]}"#)?;
///
/// let ingestor = Ingestor::new(
///     Arc::new(SqliteDetectionStore::open_in_memory()?),
///     Arc::new(JsonSnapshotParser),
///     20,
/// );
/// let outcome = ingestor.ingest(&path)?;
/// assert_eq!(outcome.status, IngestStatus::Replaced);
/// assert_eq!(outcome.records_in_file, 2);
/// assert_eq!(outcome.store_count, 1);
/// # Ok(())
/// # }
/// ```
pub struct Ingestor {
    store: Arc<dyn DetectionStore>,
    parser: Arc<dyn SnapshotParser>,
    batch_size: usize,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl Ingestor {
    /// Create an ingestor writing to `store` in batches of `batch_size`.
    #[must_use]
    pub fn new(
        store: Arc<dyn DetectionStore>,
        parser: Arc<dyn SnapshotParser>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            parser,
            batch_size,
        }
    }

    /// Store the ingestor writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DetectionStore> {
        &self.store
    }

    /// Synchronise the store from the snapshot at `path`.
    ///
    /// A missing file or an empty snapshot leaves the store untouched and is
    /// reported through [`IngestOutcome::status`]. Read and decode failures
    /// also leave the store untouched and are returned as errors.
    pub fn ingest(&self, path: &Utf8Path) -> Result<IngestOutcome, IngestError> {
        if !Self::is_readable_file(path)? {
            info!("snapshot not present, skipping sync: path = {path}");
            return self.untouched(IngestStatus::MissingFile);
        }

        let bytes = trafficsync_fs::read_file(path).map_err(|source| IngestError::Read {
            path: path.to_owned(),
            source,
        })?;
        let entries = self
            .parser
            .decode_snapshot(&bytes)
            .map_err(|source| IngestError::Decode {
                path: path.to_owned(),
                source,
            })?;
        if entries.is_empty() {
            warn!("snapshot holds no detections, keeping current data: path = {path}");
            return self.untouched(IngestStatus::EmptySnapshot);
        }

        let records_in_file = entries.len();
        let conversion = convert::convert_entries(self.parser.as_ref(), entries);
        let report = self
            .store
            .replace_all(&conversion.records, self.batch_size)
            .map_err(store_error("replace detections"))?;
        let store_count = self.store.count().map_err(store_error("count detections"))?;

        let outcome = IngestOutcome {
            status: IngestStatus::Replaced,
            records_in_file,
            records_persisted: report.inserted,
            errors: conversion.invalid + report.failed_batches,
            store_count,
        };
        Self::verify(path, &outcome);
        Ok(outcome)
    }

    fn is_readable_file(path: &Utf8Path) -> Result<bool, IngestError> {
        match trafficsync_fs::file_is_file(path) {
            Ok(is_file) => Ok(is_file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(IngestError::Read {
                path: path.to_owned(),
                source,
            }),
        }
    }

    fn untouched(&self, status: IngestStatus) -> Result<IngestOutcome, IngestError> {
        let store_count = self.store.count().map_err(store_error("count detections"))?;
        Ok(IngestOutcome {
            status,
            records_in_file: 0,
            records_persisted: 0,
            errors: 0,
            store_count,
        })
    }

    fn verify(path: &Utf8Path, outcome: &IngestOutcome) {
        if outcome.is_consistent() {
            info!(
                "snapshot synchronised: path = {path}, in_file = {}, persisted = {}, errors = {}",
                outcome.records_in_file, outcome.records_persisted, outcome.errors
            );
        } else {
            warn!(
                "store count differs from persisted records: path = {path}, persisted = {}, store_count = {}",
                outcome.records_persisted, outcome.store_count
            );
        }
    }
}
