//! Transient-failure classification and retry bounds.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use trafficsync_core::StoreError;

use crate::ingest::IngestError;

/// Delay before a transient failure is retried.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
/// Retries attempted before a failure is dropped.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Message fragments that mark a failure as transient, matched
/// case-insensitively against every error in the source chain.
const TRANSIENT_MARKERS: [&str; 5] = [
    "locked",
    "access denied",
    "being used by another process",
    "resource temporarily unavailable",
    "sharing violation",
];

/// Fixed-backoff retry bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before each retry.
    pub backoff: Duration,
    /// Maximum number of retries after the first failure.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            backoff: Duration::ZERO,
            max_attempts: 0,
        }
    }

    /// Whether another retry is allowed after `retries` have already run.
    #[must_use]
    pub const fn allows(&self, retries: u32) -> bool {
        retries < self.max_attempts
    }
}

/// Decide whether `error` is worth retrying.
///
/// Read failures are always retryable and decode failures never are. Store
/// failures are retryable on lock contention, on the I/O kinds listed below,
/// or when any error in the chain mentions a transient condition.
///
/// Transient I/O kinds: `PermissionDenied`, `NotFound`, `WouldBlock`,
/// `Interrupted` and `TimedOut`.
///
/// # Examples
/// ```
/// use trafficsync_core::StoreError;
/// use trafficsync_ingest::{IngestError, is_retryable};
///
/// let locked = IngestError::Store {
///     operation: "replace detections",
///     source: StoreError::Unavailable { message: "database is locked".into() },
/// };
/// assert!(is_retryable(&locked));
/// ```
#[must_use]
pub fn is_retryable(error: &IngestError) -> bool {
    match error {
        IngestError::Read { .. } => true,
        IngestError::Decode { .. } => false,
        IngestError::Store { source, .. } => {
            store_error_is_transient(source) || mentions_transient_condition(error)
        }
    }
}

fn store_error_is_transient(error: &StoreError) -> bool {
    error.is_lock_contention()
        || matches!(
            error.io_kind(),
            Some(
                io::ErrorKind::PermissionDenied
                    | io::ErrorKind::NotFound
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
            )
        )
}

fn mentions_transient_condition(error: &(dyn StdError + 'static)) -> bool {
    std::iter::successors(Some(error), |&current| current.source()).any(|current| {
        let message = current.to_string().to_lowercase();
        TRANSIENT_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use trafficsync_core::{JsonSnapshotParser, SnapshotParser};

    fn store_failure(source: StoreError) -> IngestError {
        IngestError::Store {
            operation: "replace detections",
            source,
        }
    }

    fn io_failure(kind: io::ErrorKind) -> StoreError {
        StoreError::Io {
            operation: "open database",
            source: io::Error::from(kind),
        }
    }

    #[rstest]
    #[case(io::ErrorKind::NotFound)]
    #[case(io::ErrorKind::Other)]
    fn read_failures_are_retryable(#[case] kind: io::ErrorKind) {
        let error = IngestError::Read {
            path: Utf8PathBuf::from("detections.json"),
            source: io::Error::from(kind),
        };
        assert!(is_retryable(&error));
    }

    #[rstest]
    fn decode_failures_are_not_retryable() {
        let source = JsonSnapshotParser
            .decode_snapshot(b"{\"detections\": [")
            .expect_err("truncated snapshot");
        let error = IngestError::Decode {
            path: Utf8PathBuf::from("detections.json"),
            source,
        };
        assert!(!is_retryable(&error));
    }

    #[rstest]
    #[case(io::ErrorKind::PermissionDenied, true)]
    #[case(io::ErrorKind::NotFound, true)]
    #[case(io::ErrorKind::WouldBlock, true)]
    #[case(io::ErrorKind::Interrupted, true)]
    #[case(io::ErrorKind::TimedOut, true)]
    #[case(io::ErrorKind::InvalidData, false)]
    fn store_io_failures_follow_their_kind(#[case] kind: io::ErrorKind, #[case] expected: bool) {
        assert_eq!(is_retryable(&store_failure(io_failure(kind))), expected);
    }

    #[rstest]
    #[case("Database is LOCKED", true)]
    #[case("Access denied by policy", true)]
    #[case("file is being used by another process", true)]
    #[case("Resource temporarily unavailable", true)]
    #[case("sharing violation on detections.db", true)]
    #[case("unique constraint failed", false)]
    fn rejected_writes_are_classified_by_message(#[case] reason: &str, #[case] expected: bool) {
        let error = store_failure(StoreError::Rejected {
            reason: reason.to_owned(),
        });
        assert_eq!(is_retryable(&error), expected);
    }

    #[derive(Debug, thiserror::Error)]
    #[error("replace detections failed")]
    struct Wrapped(#[source] io::Error);

    #[rstest]
    #[case("database is locked", true)]
    #[case("disk image is malformed", false)]
    fn markers_are_found_below_the_outer_error(#[case] inner: &str, #[case] expected: bool) {
        let error = Wrapped(io::Error::other(inner.to_owned()));
        assert_eq!(mentions_transient_condition(&error), expected);
    }

    #[rstest]
    fn store_io_failures_with_transient_messages_are_retryable() {
        let error = store_failure(StoreError::Io {
            operation: "replace detections",
            source: io::Error::other("database table is locked"),
        });
        assert!(is_retryable(&error));
    }

    #[rstest]
    fn unavailable_store_is_retryable() {
        let error = store_failure(StoreError::Unavailable {
            message: "maintenance".to_owned(),
        });
        assert!(is_retryable(&error));
    }

    #[rstest]
    #[case(0, true)]
    #[case(4, true)]
    #[case(5, false)]
    fn default_policy_allows_five_retries(#[case] retries: u32, #[case] expected: bool) {
        assert_eq!(RetryPolicy::default().allows(retries), expected);
        assert!(!RetryPolicy::disabled().allows(0));
    }
}
