//! Core domain types for trafficsync.
//!
//! The crate defines the persisted [`DetectionRecord`], the snapshot
//! decoding seam ([`SnapshotParser`]) and the storage seam
//! ([`DetectionStore`]). The ingestion pipeline in `trafficsync-ingest` is
//! written purely against these traits.

mod record;
pub mod snapshot;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use record::{
    DetectionRecord, EMPTY_PAYLOAD, LaneCounts, LaneSpeeds, PayloadKind, TypeCounts,
    normalise_payload,
};
pub use snapshot::{DecodeError, EncodeError, JsonSnapshotParser, SnapshotEntry, SnapshotParser};
#[cfg(feature = "store-sqlite")]
pub use store::SqliteDetectionStore;
pub use store::{DetectionStore, ReplaceReport, StoreError};
