//! Persisted detection records and payload normalisation.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Stored form of an absent or unusable payload.
pub const EMPTY_PAYLOAD: &str = "{}";

/// Vehicle counts keyed by vehicle type.
pub type TypeCounts = BTreeMap<String, u64>;

/// Vehicle counts keyed by lane, then by vehicle type.
pub type LaneCounts = BTreeMap<String, TypeCounts>;

/// Average speed keyed by lane.
pub type LaneSpeeds = BTreeMap<String, f64>;

/// Identifies one of the aggregate payloads carried by a [`DetectionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Totals per vehicle type (`objects_total`).
    TotalsByType,
    /// Totals per lane and vehicle type (`objects_by_lane`).
    TotalsByLane,
    /// Average speed per lane (`avg_speed_by_lane`).
    AvgSpeedByLane,
}

impl PayloadKind {
    /// Every payload kind, in storage column order.
    pub const ALL: [Self; 3] = [Self::TotalsByType, Self::TotalsByLane, Self::AvgSpeedByLane];

    /// Column (and snapshot field) name backing this payload.
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::TotalsByType => "objects_total",
            Self::TotalsByLane => "objects_by_lane",
            Self::AvgSpeedByLane => "avg_speed_by_lane",
        }
    }
}

/// One traffic detection as persisted by the store.
///
/// Payloads are kept as JSON object text. Anything that is not a JSON object
/// is normalised to [`EMPTY_PAYLOAD`], so consumers only ever test for
/// emptiness and never for null.
///
/// # Examples
/// ```
/// use trafficsync_core::{DetectionRecord, PayloadKind};
///
/// let record = DetectionRecord::new(1_700_000_000_000, None)
///     .with_payload(PayloadKind::TotalsByType, Some(r#"{"car":3}"#));
///
/// assert!(record.has_payload(PayloadKind::TotalsByType));
/// assert_eq!(record.payload(PayloadKind::AvgSpeedByLane), "{}");
/// assert_eq!(record.totals_by_type().unwrap().get("car"), Some(&3));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionRecord {
    timestamp: u64,
    date: Option<String>,
    totals_by_type: String,
    totals_by_lane: String,
    avg_speed_by_lane: String,
}

impl DetectionRecord {
    /// Create a record with all payloads empty.
    #[must_use]
    pub fn new(timestamp: u64, date: Option<String>) -> Self {
        Self {
            timestamp,
            date,
            totals_by_type: EMPTY_PAYLOAD.to_owned(),
            totals_by_lane: EMPTY_PAYLOAD.to_owned(),
            avg_speed_by_lane: EMPTY_PAYLOAD.to_owned(),
        }
    }

    /// Return a copy with the given payload text, normalised.
    #[must_use]
    pub fn with_payload(mut self, kind: PayloadKind, text: Option<&str>) -> Self {
        let normalised = normalise_payload(text);
        match kind {
            PayloadKind::TotalsByType => self.totals_by_type = normalised,
            PayloadKind::TotalsByLane => self.totals_by_lane = normalised,
            PayloadKind::AvgSpeedByLane => self.avg_speed_by_lane = normalised,
        }
        self
    }

    /// Epoch milliseconds at which the detection batch was produced.
    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Human-readable date supplied by the exporter, if any.
    #[must_use]
    pub fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    /// Stored JSON text for `kind`; never empty.
    #[must_use]
    pub fn payload(&self, kind: PayloadKind) -> &str {
        match kind {
            PayloadKind::TotalsByType => &self.totals_by_type,
            PayloadKind::TotalsByLane => &self.totals_by_lane,
            PayloadKind::AvgSpeedByLane => &self.avg_speed_by_lane,
        }
    }

    /// Whether `kind` holds anything other than the empty object.
    #[must_use]
    pub fn has_payload(&self, kind: PayloadKind) -> bool {
        self.payload(kind) != EMPTY_PAYLOAD
    }

    /// Decode the payload for `kind` into `T`.
    pub fn decode_payload<T: DeserializeOwned>(
        &self,
        kind: PayloadKind,
    ) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.payload(kind))
    }

    /// Decoded `objects_total` payload.
    pub fn totals_by_type(&self) -> Result<TypeCounts, serde_json::Error> {
        self.decode_payload(PayloadKind::TotalsByType)
    }

    /// Decoded `objects_by_lane` payload.
    pub fn totals_by_lane(&self) -> Result<LaneCounts, serde_json::Error> {
        self.decode_payload(PayloadKind::TotalsByLane)
    }

    /// Decoded `avg_speed_by_lane` payload.
    pub fn avg_speed_by_lane(&self) -> Result<LaneSpeeds, serde_json::Error> {
        self.decode_payload(PayloadKind::AvgSpeedByLane)
    }
}

/// Normalise stored payload text.
///
/// Missing, blank, `null`, unparseable and non-object values all become
/// [`EMPTY_PAYLOAD`]. Objects are kept verbatim (trimmed).
#[must_use]
pub fn normalise_payload(text: Option<&str>) -> String {
    let Some(trimmed) = text.map(str::trim).filter(|value| !value.is_empty()) else {
        return EMPTY_PAYLOAD.to_owned();
    };
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) if !map.is_empty() => trimmed.to_owned(),
        _ => EMPTY_PAYLOAD.to_owned(),
    }
}
