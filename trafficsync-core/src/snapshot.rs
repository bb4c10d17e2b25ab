//! Snapshot decoding and payload encoding.
//!
//! An exporter periodically rewrites one JSON file holding the full set of
//! current detections:
//!
//! ```json
//! { "detections": [ { "timestamp_ms": 1700000000000, "objects_total": { "car": 3 } } ] }
//! ```
//!
//! [`SnapshotParser`] is the seam the ingestion pipeline decodes through;
//! [`JsonSnapshotParser`] is the `serde_json` implementation.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// One entry of the `detections` list as exported, before conversion.
///
/// Every field is optional at this stage; entries without `timestamp_ms` are
/// dropped during ingestion. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SnapshotEntry {
    /// Epoch milliseconds of the detection batch.
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
    /// Human-readable date string.
    #[serde(default)]
    pub date: Option<String>,
    /// Totals per vehicle type.
    #[serde(default)]
    pub objects_total: Option<Value>,
    /// Totals per lane and vehicle type.
    #[serde(default)]
    pub objects_by_lane: Option<Value>,
    /// Average speed per lane.
    #[serde(default)]
    pub avg_speed_by_lane: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SnapshotDocument {
    #[serde(default)]
    detections: Option<Vec<SnapshotEntry>>,
}

/// Errors raised while decoding a snapshot file.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes were not valid JSON, or the entries had the wrong shape.
    #[error("malformed snapshot: {source}")]
    Malformed {
        /// Underlying `serde_json` failure.
        #[source]
        source: serde_json::Error,
    },
    /// The top-level JSON value was not an object.
    #[error("snapshot must be a JSON object, found {found}")]
    NotAnObject {
        /// JSON type name of the top-level value.
        found: &'static str,
    },
}

/// Errors raised while encoding a payload value back to text.
#[derive(Debug, Error)]
#[error("failed to encode payload: {source}")]
pub struct EncodeError {
    #[from]
    source: serde_json::Error,
}

/// Decodes snapshot bytes and encodes payload sub-structures.
pub trait SnapshotParser: Send + Sync {
    /// Decode the full snapshot into its entries.
    ///
    /// A missing or `null` `detections` list decodes to an empty vector.
    fn decode_snapshot(&self, bytes: &[u8]) -> Result<Vec<SnapshotEntry>, DecodeError>;

    /// Encode a payload value to the text form kept by the store.
    fn encode_value(&self, value: &Value) -> Result<String, EncodeError>;
}

/// [`SnapshotParser`] backed by `serde_json`.
///
/// # Examples
/// ```
/// use trafficsync_core::snapshot::{JsonSnapshotParser, SnapshotParser};
///
/// let parser = JsonSnapshotParser;
/// let entries = parser
///     .decode_snapshot(br#"{"detections":[{"timestamp_ms":1,"date":"today"}]}"#)
///     .expect("decode snapshot");
/// assert_eq!(entries.len(), 1);
/// assert_eq!(entries[0].timestamp_ms, Some(1));
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSnapshotParser;

impl SnapshotParser for JsonSnapshotParser {
    fn decode_snapshot(&self, bytes: &[u8]) -> Result<Vec<SnapshotEntry>, DecodeError> {
        let document: Value =
            serde_json::from_slice(bytes).map_err(|source| DecodeError::Malformed { source })?;
        if !document.is_object() {
            return Err(DecodeError::NotAnObject {
                found: json_type_name(&document),
            });
        }
        let parsed = SnapshotDocument::deserialize(document)
            .map_err(|source| DecodeError::Malformed { source })?;
        Ok(parsed.detections.unwrap_or_default())
    }

    fn encode_value(&self, value: &Value) -> Result<String, EncodeError> {
        serde_json::to_string(value).map_err(EncodeError::from)
    }
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
