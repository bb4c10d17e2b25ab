//! Test-only, in-memory `DetectionStore` implementation used by unit and
//! behaviour tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{DetectionRecord, DetectionStore, PayloadKind, StoreError};

/// Failure returned by an injected store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Transient lock contention (`database is locked`).
    Locked,
    /// A permanent rejection of the write.
    Rejected,
}

impl InjectedFailure {
    fn into_error(self) -> StoreError {
        match self {
            Self::Locked => StoreError::Unavailable {
                message: "database is locked".to_owned(),
            },
            Self::Rejected => StoreError::Rejected {
                reason: "injected failure".to_owned(),
            },
        }
    }
}

/// In-memory `DetectionStore` used in tests.
///
/// Lookups sort on every call and are intended only for small datasets.
/// Failures can be queued for `insert_batch` and `delete_all` to exercise
/// the retry and batch-skipping paths.
#[derive(Debug, Default)]
pub struct MemoryDetectionStore {
    records: Mutex<Vec<DetectionRecord>>,
    insert_failures: Mutex<VecDeque<InjectedFailure>>,
    delete_failures: Mutex<VecDeque<InjectedFailure>>,
    insert_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryDetectionStore {
    /// Create a store holding `records`.
    pub fn with_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = DetectionRecord>,
    {
        Self {
            records: Mutex::new(records.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Make the next `times` calls to `insert_batch` fail with `failure`.
    pub fn fail_next_inserts(&self, failure: InjectedFailure, times: usize) {
        lock(&self.insert_failures).extend(std::iter::repeat_n(failure, times));
    }

    /// Make the next `times` calls to `delete_all` fail with `failure`.
    pub fn fail_next_deletes(&self, failure: InjectedFailure, times: usize) {
        lock(&self.delete_failures).extend(std::iter::repeat_n(failure, times));
    }

    /// Number of `insert_batch` calls so far, failed ones included.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Number of `delete_all` calls so far, failed ones included.
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Copy of the stored records in insertion order.
    pub fn snapshot(&self) -> Vec<DetectionRecord> {
        lock(&self.records).clone()
    }

    fn sorted(&self, newest_first: bool) -> Vec<DetectionRecord> {
        let mut records = self.snapshot();
        records.sort_by_key(DetectionRecord::timestamp);
        if newest_first {
            records.reverse();
        }
        records
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DetectionStore for MemoryDetectionStore {
    fn count(&self) -> Result<u64, StoreError> {
        Ok(lock(&self.records).len() as u64)
    }

    fn delete_all(&self) -> Result<u64, StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = lock(&self.delete_failures).pop_front() {
            return Err(failure.into_error());
        }
        let mut records = lock(&self.records);
        let deleted = records.len() as u64;
        records.clear();
        Ok(deleted)
    }

    fn insert_batch(&self, batch: &[DetectionRecord]) -> Result<usize, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = lock(&self.insert_failures).pop_front() {
            return Err(failure.into_error());
        }
        lock(&self.records).extend_from_slice(batch);
        Ok(batch.len())
    }

    fn find_recent(&self, limit: usize) -> Result<Vec<DetectionRecord>, StoreError> {
        let mut records = self.sorted(true);
        records.truncate(limit);
        Ok(records)
    }

    fn find_with_non_empty_payload(
        &self,
        kind: PayloadKind,
    ) -> Result<Vec<DetectionRecord>, StoreError> {
        let mut records = self.sorted(true);
        records.retain(|record| record.has_payload(kind));
        Ok(records)
    }

    fn find_by_timestamp_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<DetectionRecord>, StoreError> {
        let mut records = self.sorted(false);
        records.retain(|record| (start..=end).contains(&record.timestamp()));
        Ok(records)
    }

    fn find_by_date_pattern(&self, pattern: &str) -> Result<Vec<DetectionRecord>, StoreError> {
        let pattern: Vec<char> = pattern.chars().collect();
        let mut records = self.sorted(false);
        records.retain(|record| {
            record.date().is_some_and(|date| {
                let date: Vec<char> = date.chars().collect();
                like_matches(&pattern, &date)
            })
        });
        Ok(records)
    }

    fn find_all_ordered(&self) -> Result<Vec<DetectionRecord>, StoreError> {
        Ok(self.sorted(false))
    }
}

/// SQL `LIKE` matching with SQLite's default ASCII case folding.
fn like_matches(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('%', rest)) => (0..=text.len())
            .any(|skip| text.get(skip..).is_some_and(|tail| like_matches(rest, tail))),
        Some(('_', rest)) => text
            .split_first()
            .is_some_and(|(_, tail)| like_matches(rest, tail)),
        Some((expected, rest)) => text.split_first().is_some_and(|(actual, tail)| {
            actual.eq_ignore_ascii_case(expected) && like_matches(rest, tail)
        }),
    }
}
