//! Directory-watch, debounce and reload pipeline for trafficsync.
//!
//! Responsibilities:
//! - Watch one directory for rewrites of one snapshot file.
//! - Coalesce bursts of change notifications into a single delayed reload.
//! - Replace the store contents from the snapshot and retry transient
//!   failures with a bounded, fixed backoff.
//!
//! Boundaries:
//! - Storage and decoding are reached only through the `DetectionStore` and
//!   `SnapshotParser` traits from `trafficsync-core`.
//! - Ingest runs never overlap: every run passes through the scheduler's
//!   single-permit gate.
//!
//! Invariants:
//! - No global mutable state; a [`SyncService`] owns everything it starts.
//! - Ingestion failures are logged or returned, never propagated as panics.
#![forbid(unsafe_code)]

pub mod config;
pub mod ingest;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod watcher;

pub use config::SyncConfig;
pub use ingest::{IngestError, IngestOutcome, IngestStatus, Ingestor};
pub use retry::{RetryPolicy, is_retryable};
pub use scheduler::{DebounceScheduler, SchedulerConfig, SchedulerError, SyncJob};
pub use service::{SyncError, SyncService, SyncStatus};
pub use watcher::{ChangeKind, ChangeSink, DirectoryWatcher, FileChangeEvent, WatchError};
