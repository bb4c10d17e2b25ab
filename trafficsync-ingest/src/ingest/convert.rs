//! Conversion of decoded snapshot entries into persisted records.

use log::{debug, warn};
use serde_json::Value;
use trafficsync_core::{DetectionRecord, PayloadKind, SnapshotEntry, SnapshotParser};

/// Records ready for the store plus the bookkeeping the outcome reports.
#[derive(Debug, Default)]
pub(super) struct Conversion {
    pub(super) records: Vec<DetectionRecord>,
    pub(super) without_timestamp: usize,
    pub(super) invalid: usize,
}

pub(super) fn convert_entries(
    parser: &dyn SnapshotParser,
    entries: Vec<SnapshotEntry>,
) -> Conversion {
    let mut conversion = Conversion {
        records: Vec::with_capacity(entries.len()),
        ..Conversion::default()
    };
    for entry in entries {
        let Some(raw) = entry.timestamp_ms else {
            conversion.without_timestamp += 1;
            continue;
        };
        let Ok(timestamp) = u64::try_from(raw) else {
            warn!("dropping detection with negative timestamp: timestamp_ms = {raw}");
            conversion.invalid += 1;
            continue;
        };
        conversion.records.push(convert_entry(parser, timestamp, &entry));
    }
    if conversion.without_timestamp > 0 {
        debug!(
            "dropped detections without timestamp: count = {}",
            conversion.without_timestamp
        );
    }
    conversion
}

fn convert_entry(
    parser: &dyn SnapshotParser,
    timestamp: u64,
    entry: &SnapshotEntry,
) -> DetectionRecord {
    PayloadKind::ALL.into_iter().fold(
        DetectionRecord::new(timestamp, entry.date.clone()),
        |record, kind| {
            let text = payload_value(entry, kind).and_then(|value| encode(parser, kind, value));
            record.with_payload(kind, text.as_deref())
        },
    )
}

const fn payload_value(entry: &SnapshotEntry, kind: PayloadKind) -> Option<&Value> {
    match kind {
        PayloadKind::TotalsByType => entry.objects_total.as_ref(),
        PayloadKind::TotalsByLane => entry.objects_by_lane.as_ref(),
        PayloadKind::AvgSpeedByLane => entry.avg_speed_by_lane.as_ref(),
    }
}

fn encode(parser: &dyn SnapshotParser, kind: PayloadKind, value: &Value) -> Option<String> {
    match parser.encode_value(value) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(
                "storing empty payload after encode failure: field = {}, error = {err}",
                kind.column()
            );
            None
        }
    }
}
