//! Persistence seam for detection records.
//!
//! The [`DetectionStore`] trait is the only way the ingestion pipeline
//! touches persisted data. Each synchronisation cycle replaces the whole data
//! set through [`DetectionStore::replace_all`]; the lookups exist for status
//! reporting and for embedding query layers.

use std::io;

use thiserror::Error;

use crate::{DetectionRecord, PayloadKind};

#[cfg(feature = "store-sqlite")]
mod sqlite;

#[cfg(feature = "store-sqlite")]
pub use sqlite::SqliteDetectionStore;

/// Errors raised by [`DetectionStore`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A SQLite statement failed.
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite {operation} failed: {source}")]
    Sqlite {
        /// Short name of the failing operation.
        operation: &'static str,
        /// Error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// A timestamp did not fit the backing column type.
    #[error("timestamp {timestamp} cannot be represented by the store")]
    TimestampOutOfRange {
        /// Offending timestamp in epoch milliseconds.
        timestamp: u64,
    },
    /// Filesystem access backing the store failed.
    #[error("{operation} failed: {source}")]
    Io {
        /// Short name of the failing operation.
        operation: &'static str,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The store is temporarily unavailable, for example because another
    /// writer holds its lock.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Backend-supplied description.
        message: String,
    },
    /// The store refused the write.
    #[error("store rejected the write: {reason}")]
    Rejected {
        /// Backend-supplied description.
        reason: String,
    },
}

impl StoreError {
    /// Whether the failure is caused by another party holding the store.
    ///
    /// Lock contention aborts [`DetectionStore::replace_all`] instead of
    /// being counted as a failed batch, so the caller can retry the cycle.
    #[must_use]
    pub fn is_lock_contention(&self) -> bool {
        match self {
            #[cfg(feature = "store-sqlite")]
            Self::Sqlite { source, .. } => sqlite::is_busy_or_locked(source),
            Self::Unavailable { .. } => true,
            _ => false,
        }
    }

    /// Kind of the underlying I/O error, if any.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

/// Counts produced by [`DetectionStore::replace_all`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceReport {
    /// Records removed before inserting.
    pub deleted: u64,
    /// Records inserted successfully.
    pub inserted: usize,
    /// Batches that failed and were skipped.
    pub failed_batches: usize,
    /// Records contained in the skipped batches.
    pub failed_records: usize,
}

/// Read/write access to the persisted detection set.
///
/// Implementations must be shareable across threads: the ingestion pipeline
/// writes from a worker thread while status queries may run elsewhere.
///
/// # Examples
///
/// ```
/// use trafficsync_core::{DetectionRecord, DetectionStore, SqliteDetectionStore};
///
/// # fn main() -> Result<(), trafficsync_core::StoreError> {
/// let store = SqliteDetectionStore::open_in_memory()?;
/// let records = vec![
///     DetectionRecord::new(1, None),
///     DetectionRecord::new(2, None),
/// ];
/// let report = store.replace_all(&records, 20)?;
/// assert_eq!(report.inserted, 2);
/// assert_eq!(store.count()?, 2);
/// assert_eq!(store.find_most_recent()?.map(|r| r.timestamp()), Some(2));
/// # Ok(())
/// # }
/// ```
pub trait DetectionStore: Send + Sync {
    /// Number of persisted records.
    fn count(&self) -> Result<u64, StoreError>;

    /// Remove every record, returning how many were removed.
    fn delete_all(&self) -> Result<u64, StoreError>;

    /// Insert `records` as one unit, returning how many were written.
    fn insert_batch(&self, records: &[DetectionRecord]) -> Result<usize, StoreError>;

    /// Replace the whole data set with `records`, inserting `batch_size`
    /// records at a time.
    ///
    /// A batch failing for a reason other than lock contention is logged,
    /// counted in the report and skipped. Lock contention aborts the replace
    /// and is returned to the caller.
    ///
    /// The default implementation deletes first and then inserts batch by
    /// batch, so readers may observe the store part-way through. Stores with
    /// transactions should override it.
    fn replace_all(
        &self,
        records: &[DetectionRecord],
        batch_size: usize,
    ) -> Result<ReplaceReport, StoreError> {
        let deleted = self.delete_all()?;
        let mut report = insert_in_batches(records, batch_size, |batch| self.insert_batch(batch))?;
        report.deleted = deleted;
        Ok(report)
    }

    /// Most recent `limit` records, newest first.
    fn find_recent(&self, limit: usize) -> Result<Vec<DetectionRecord>, StoreError>;

    /// Record with the greatest timestamp.
    fn find_most_recent(&self) -> Result<Option<DetectionRecord>, StoreError> {
        Ok(self.find_recent(1)?.into_iter().next())
    }

    /// Records whose `kind` payload is not empty, newest first.
    fn find_with_non_empty_payload(
        &self,
        kind: PayloadKind,
    ) -> Result<Vec<DetectionRecord>, StoreError>;

    /// Records with `start <= timestamp <= end`, oldest first.
    fn find_by_timestamp_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<DetectionRecord>, StoreError>;

    /// Records whose date label matches the SQL `LIKE` pattern `pattern`,
    /// oldest first.
    ///
    /// `%` matches any run of characters and `_` exactly one; ASCII letters
    /// compare case-insensitively. Records without a date never match.
    fn find_by_date_pattern(&self, pattern: &str) -> Result<Vec<DetectionRecord>, StoreError>;

    /// Every record, oldest first.
    fn find_all_ordered(&self) -> Result<Vec<DetectionRecord>, StoreError>;

    /// Whether at least one record is stored.
    fn exists_any(&self) -> Result<bool, StoreError> {
        Ok(self.count()? > 0)
    }
}

/// Feed `records` to `insert` in chunks of `batch_size` (at least one).
///
/// Shared by the default `replace_all` and by store-specific overrides so
/// both count and skip failed batches the same way.
pub(crate) fn insert_in_batches<F>(
    records: &[DetectionRecord],
    batch_size: usize,
    mut insert: F,
) -> Result<ReplaceReport, StoreError>
where
    F: FnMut(&[DetectionRecord]) -> Result<usize, StoreError>,
{
    let mut report = ReplaceReport::default();
    for (index, batch) in records.chunks(batch_size.max(1)).enumerate() {
        match insert(batch) {
            Ok(inserted) => report.inserted += inserted,
            Err(err) if err.is_lock_contention() => return Err(err),
            Err(err) => {
                log::warn!(
                    "skipping failed batch: batch = {index}, records = {}, error = {err}",
                    batch.len()
                );
                report.failed_batches += 1;
                report.failed_records += batch.len();
            }
        }
    }
    Ok(report)
}
