//! Behavioural tests for `Ingestor` against a SQLite store.

use std::cell::RefCell;
use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use serde_json::json;
use tempfile::TempDir;
use trafficsync_core::{
    DetectionRecord, DetectionStore, JsonSnapshotParser, PayloadKind, SqliteDetectionStore,
};
use trafficsync_ingest::{IngestError, IngestOutcome, Ingestor};

/// Shared state for ingest scenarios.
struct IngestWorld {
    _temp_dir: TempDir,
    snapshot: Utf8PathBuf,
    store: Arc<SqliteDetectionStore>,
    result: RefCell<Option<Result<IngestOutcome, IngestError>>>,
}

impl IngestWorld {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let root = Utf8PathBuf::from_path_buf(temp_dir.path().to_path_buf())
            .expect("utf-8 temp dir");
        let store = SqliteDetectionStore::open(root.join("detections.db").as_std_path())
            .expect("open store");
        Self {
            snapshot: root.join("detections.json"),
            _temp_dir: temp_dir,
            store: Arc::new(store),
            result: RefCell::new(None),
        }
    }

    fn write(&self, body: &serde_json::Value) {
        self.write_raw(&body.to_string());
    }

    fn write_raw(&self, body: &str) {
        std::fs::write(&self.snapshot, body).expect("write snapshot");
    }

    fn outcome(&self) -> IngestOutcome {
        match self.result.borrow().as_ref().expect("ingest should have run") {
            Ok(outcome) => outcome.clone(),
            Err(err) => panic!("ingest failed: {err}"),
        }
    }

    fn newest(&self) -> DetectionRecord {
        self.store
            .find_most_recent()
            .expect("query newest")
            .expect("a stored detection")
    }
}

#[fixture]
fn world() -> IngestWorld {
    IngestWorld::new()
}

#[given("a SQLite store holding {count} detections")]
fn given_store(world: &IngestWorld, count: u64) {
    let records: Vec<_> = (1..=count).map(|ts| DetectionRecord::new(ts, None)).collect();
    world.store.insert_batch(&records).expect("seed store");
}

#[given("a snapshot with {total} entries of which {missing} lacks a timestamp")]
fn given_partial_snapshot(world: &IngestWorld, total: usize, missing: usize) {
    let detections: Vec<_> = (0..total)
        .map(|index| {
            if index < missing {
                json!({ "date": "2024-05-01T08:00:00Z" })
            } else {
                json!({ "timestamp_ms": 1_714_550_400_000_u64 + index as u64 })
            }
        })
        .collect();
    world.write(&json!({ "detections": detections }));
}

#[given("a snapshot without detections")]
fn given_empty_snapshot(world: &IngestWorld) {
    world.write(&json!({ "detections": [] }));
}

#[given("a truncated snapshot")]
fn given_truncated_snapshot(world: &IngestWorld) {
    world.write_raw(r#"{"detections": [{"timestamp_ms": 1"#);
}

#[given("a snapshot with one detection of {cars} cars")]
fn given_car_snapshot(world: &IngestWorld, cars: u64) {
    world.write(&json!({
        "detections": [{
            "timestamp_ms": 1_714_550_400_000_u64,
            "objects_total": { "car": cars },
            "objects_by_lane": { "lane_1": { "car": cars } }
        }]
    }));
}

#[when("the snapshot is ingested")]
fn when_ingested(world: &IngestWorld) {
    let ingestor = Ingestor::new(world.store.clone(), Arc::new(JsonSnapshotParser), 20);
    world.result.replace(Some(ingestor.ingest(&world.snapshot)));
}

#[then("the store holds {count} detections")]
fn then_store_holds(world: &IngestWorld, count: u64) {
    assert_eq!(world.store.count().expect("count detections"), count);
}

#[then("the outcome counts {count} entries in the file")]
fn then_entries_in_file(world: &IngestWorld, count: usize) {
    assert_eq!(world.outcome().records_in_file, count);
}

#[then("the outcome status is {status:word}")]
fn then_status(world: &IngestWorld, status: String) {
    let json = serde_json::to_value(world.outcome().status).expect("serialise status");
    assert_eq!(json, json!(status.trim_matches('"')));
}

#[then("the ingest fails to decode")]
fn then_decode_failure(world: &IngestWorld) {
    let result = world.result.borrow();
    assert!(matches!(
        result.as_ref().expect("ingest should have run"),
        Err(IngestError::Decode { .. })
    ));
}

#[then("the newest detection reports {cars} cars")]
fn then_newest_cars(world: &IngestWorld, cars: u64) {
    let totals = world.newest().totals_by_type().expect("decode totals");
    assert_eq!(totals.get("car"), Some(&cars));
}

#[then("the newest detection has no lane speeds")]
fn then_no_lane_speeds(world: &IngestWorld) {
    let newest = world.newest();
    assert_eq!(newest.payload(PayloadKind::AvgSpeedByLane), "{}");
    assert!(newest.avg_speed_by_lane().expect("decode speeds").is_empty());
}

#[scenario(path = "tests/features/snapshot_ingest.feature", index = 0)]
fn entries_without_timestamp(world: IngestWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/snapshot_ingest.feature", index = 1)]
fn empty_snapshot(world: IngestWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/snapshot_ingest.feature", index = 2)]
fn malformed_snapshot(world: IngestWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/snapshot_ingest.feature", index = 3)]
fn car_totals_round_trip(world: IngestWorld) {
    let _ = world;
}
