//! SQLite-backed detection store.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rusqlite::{Connection, ErrorCode, Params, Row, params};

use super::{DetectionStore, ReplaceReport, StoreError, insert_in_batches};
use crate::{DetectionRecord, PayloadKind};

/// How long a statement waits on a lock held by another connection before
/// failing with `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS detections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp_ms INTEGER NOT NULL,
        date TEXT,
        objects_total TEXT NOT NULL DEFAULT '{}',
        objects_by_lane TEXT NOT NULL DEFAULT '{}',
        avg_speed_by_lane TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS detections_timestamp_idx ON detections (timestamp_ms);
";

const SELECT_RECORDS: &str =
    "SELECT timestamp_ms, date, objects_total, objects_by_lane, avg_speed_by_lane FROM detections";

const INSERT_RECORD: &str = "INSERT INTO detections \
    (timestamp_ms, date, objects_total, objects_by_lane, avg_speed_by_lane) \
    VALUES (?1, ?2, ?3, ?4, ?5)";

/// Detection store persisted in a single SQLite table.
///
/// The store serialises its own access through one connection. Other
/// processes may read the same file concurrently; the database runs in WAL
/// mode so readers never block the replace transaction.
pub struct SqliteDetectionStore {
    connection: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl fmt::Debug for SqliteDetectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteDetectionStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteDetectionStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let connection = Connection::open(path).map_err(sqlite_error("open database"))?;
        connection
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(sqlite_error("configure busy timeout"))?;
        connection
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(sqlite_error("enable WAL journal"))?;
        Self::initialise(connection, Some(path.to_path_buf()))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory().map_err(sqlite_error("open database"))?;
        Self::initialise(connection, None)
    }

    /// Location of the database file, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialise(connection: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        connection
            .execute_batch(SCHEMA)
            .map_err(sqlite_error("create schema"))?;
        Ok(Self {
            connection: Mutex::new(connection),
            path,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn query_records<P: Params>(
        &self,
        operation: &'static str,
        sql: &str,
        params: P,
    ) -> Result<Vec<DetectionRecord>, StoreError> {
        let connection = self.lock();
        let mut statement = connection
            .prepare_cached(sql)
            .map_err(sqlite_error(operation))?;
        let rows = statement
            .query_map(params, record_from_row)
            .map_err(sqlite_error(operation))?;
        let records: Result<Vec<_>, _> = rows.collect();
        records.map_err(sqlite_error(operation))
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn count(&self) -> Result<u64, StoreError> {
        self.lock()
            .query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))
            .map_err(sqlite_error("count detections"))
    }

    fn delete_all(&self) -> Result<u64, StoreError> {
        let deleted = self
            .lock()
            .execute("DELETE FROM detections", [])
            .map_err(sqlite_error("delete detections"))?;
        Ok(deleted as u64)
    }

    fn insert_batch(&self, records: &[DetectionRecord]) -> Result<usize, StoreError> {
        let mut connection = self.lock();
        let tx = connection
            .transaction()
            .map_err(sqlite_error("begin insert"))?;
        let inserted = insert_rows(&tx, records)?;
        tx.commit().map_err(sqlite_error("commit insert"))?;
        Ok(inserted)
    }

    /// Replace the data set inside one transaction.
    ///
    /// Each batch runs in its own savepoint, so a failed batch is rolled
    /// back on its own while the rest of the replace proceeds. Lock
    /// contention rolls back the whole transaction and leaves the previous
    /// data set in place.
    fn replace_all(
        &self,
        records: &[DetectionRecord],
        batch_size: usize,
    ) -> Result<ReplaceReport, StoreError> {
        let mut connection = self.lock();
        let mut tx = connection
            .transaction()
            .map_err(sqlite_error("begin replace"))?;
        let deleted = tx
            .execute("DELETE FROM detections", [])
            .map_err(sqlite_error("delete detections"))?;
        let mut report = insert_in_batches(records, batch_size, |batch| {
            let savepoint = tx.savepoint().map_err(sqlite_error("open savepoint"))?;
            let inserted = insert_rows(&savepoint, batch)?;
            savepoint
                .commit()
                .map_err(sqlite_error("release savepoint"))?;
            Ok(inserted)
        })?;
        tx.commit().map_err(sqlite_error("commit replace"))?;
        report.deleted = deleted as u64;
        Ok(report)
    }

    fn find_recent(&self, limit: usize) -> Result<Vec<DetectionRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query_records(
            "find recent detections",
            &format!("{SELECT_RECORDS} ORDER BY timestamp_ms DESC, id DESC LIMIT ?1"),
            [limit],
        )
    }

    fn find_with_non_empty_payload(
        &self,
        kind: PayloadKind,
    ) -> Result<Vec<DetectionRecord>, StoreError> {
        let column = kind.column();
        self.query_records(
            "find detections with payload",
            &format!(
                "{SELECT_RECORDS} WHERE {column} IS NOT NULL AND {column} != '{{}}' \
                 AND {column} != '' ORDER BY timestamp_ms DESC, id DESC"
            ),
            [],
        )
    }

    fn find_by_timestamp_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<DetectionRecord>, StoreError> {
        let start = i64::try_from(start).unwrap_or(i64::MAX);
        let end = i64::try_from(end).unwrap_or(i64::MAX);
        self.query_records(
            "find detections in range",
            &format!(
                "{SELECT_RECORDS} WHERE timestamp_ms BETWEEN ?1 AND ?2 ORDER BY timestamp_ms, id"
            ),
            [start, end],
        )
    }

    fn find_by_date_pattern(&self, pattern: &str) -> Result<Vec<DetectionRecord>, StoreError> {
        self.query_records(
            "find detections by date",
            &format!("{SELECT_RECORDS} WHERE date LIKE ?1 ORDER BY timestamp_ms, id"),
            [pattern],
        )
    }

    fn find_all_ordered(&self) -> Result<Vec<DetectionRecord>, StoreError> {
        self.query_records(
            "find all detections",
            &format!("{SELECT_RECORDS} ORDER BY timestamp_ms, id"),
            [],
        )
    }

    fn exists_any(&self) -> Result<bool, StoreError> {
        self.lock()
            .query_row("SELECT EXISTS (SELECT 1 FROM detections)", [], |row| {
                row.get(0)
            })
            .map_err(sqlite_error("check for detections"))
    }
}

fn insert_rows(connection: &Connection, records: &[DetectionRecord]) -> Result<usize, StoreError> {
    let mut statement = connection
        .prepare_cached(INSERT_RECORD)
        .map_err(sqlite_error("prepare insert"))?;
    for record in records {
        let timestamp =
            i64::try_from(record.timestamp()).map_err(|_| StoreError::TimestampOutOfRange {
                timestamp: record.timestamp(),
            })?;
        statement
            .execute(params![
                timestamp,
                record.date(),
                record.payload(PayloadKind::TotalsByType),
                record.payload(PayloadKind::TotalsByLane),
                record.payload(PayloadKind::AvgSpeedByLane),
            ])
            .map_err(sqlite_error("insert detection"))?;
    }
    Ok(records.len())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DetectionRecord> {
    let timestamp: u64 = row.get(0)?;
    let date: Option<String> = row.get(1)?;
    let mut record = DetectionRecord::new(timestamp, date);
    for (offset, kind) in PayloadKind::ALL.into_iter().enumerate() {
        let text: Option<String> = row.get(offset + 2)?;
        record = record.with_payload(kind, text.as_deref());
    }
    Ok(record)
}

fn sqlite_error(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |source| StoreError::Sqlite { operation, source }
}

pub(super) fn is_busy_or_locked(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
