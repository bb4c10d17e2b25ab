//! Facade crate for the trafficsync snapshot pipeline.
//!
//! This crate re-exports the core domain types and the watch, debounce and
//! reload pipeline, and exposes the SQLite store behind a feature flag.

#![forbid(unsafe_code)]

pub use trafficsync_core::{
    DecodeError, DetectionRecord, DetectionStore, EncodeError, JsonSnapshotParser, PayloadKind,
    ReplaceReport, SnapshotEntry, SnapshotParser, StoreError,
};
pub use trafficsync_ingest::{
    IngestError, IngestOutcome, IngestStatus, Ingestor, RetryPolicy, SyncConfig, SyncError,
    SyncService, SyncStatus,
};

#[cfg(feature = "store-sqlite")]
pub use trafficsync_core::SqliteDetectionStore;

#[cfg(feature = "test-support")]
pub use trafficsync_core::test_support;
