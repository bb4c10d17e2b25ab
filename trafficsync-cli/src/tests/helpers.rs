//! Test helpers for scratch databases and snapshot files.

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::json;
use tempfile::TempDir;

pub(super) struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    pub(super) fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 workspace");
        Self { _dir: dir, root }
    }

    pub(super) fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub(super) fn database(&self) -> Utf8PathBuf {
        self.root.join("state").join("detections.db")
    }

    pub(super) fn snapshot(&self) -> Utf8PathBuf {
        self.root.join("detections.json")
    }

    /// Write a snapshot holding one detection per timestamp.
    pub(super) fn write_snapshot(&self, timestamps: &[u64]) {
        let detections: Vec<_> = timestamps
            .iter()
            .map(|ts| {
                json!({
                    "timestamp_ms": ts,
                    "date": format!("detection {ts}"),
                    "objects_total": { "car": 3, "truck": 1 }
                })
            })
            .collect();
        std::fs::write(
            self.snapshot(),
            json!({ "detections": detections }).to_string(),
        )
        .expect("write snapshot");
    }
}

pub(super) fn output_json(buffer: &[u8]) -> serde_json::Value {
    serde_json::from_slice(buffer).expect("command output is JSON")
}
