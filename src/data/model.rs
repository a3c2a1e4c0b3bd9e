use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// MetadataValue – a single acquisition metadata cell
// ---------------------------------------------------------------------------

/// A dynamically-typed metadata value as found in sidecar files.
/// Using `BTreeMap` / `BTreeSet` downstream so `MetadataValue` must be `Ord`.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    /// RFC 3339 date string kept as text; see [`MetadataValue::as_timestamp`].
    Date(String),
    Null,
}

// -- Manual Eq/Ord so we can put MetadataValue in BTreeSet --

impl Eq for MetadataValue {}

impl PartialOrd for MetadataValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetadataValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use MetadataValue::*;
        fn discriminant(v: &MetadataValue) -> u8 {
            match v {
                Null => 0,
                Bool(_) => 1,
                Integer(_) => 2,
                Float(_) => 3,
                String(_) => 4,
                Date(_) => 5,
            }
        }
        let da = discriminant(self);
        let db = discriminant(other);
        if da != db {
            return da.cmp(&db);
        }
        match (self, other) {
            (Null, Null) => std::cmp::Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (String(a), String(b)) | (Date(a), Date(b)) => a.cmp(b),
            _ => std::cmp::Ordering::Equal,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::String(s) => write!(f, "{s}"),
            MetadataValue::Integer(i) => write!(f, "{i}"),
            MetadataValue::Float(v) => write!(f, "{v:.4}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Date(d) => write!(f, "{d}"),
            MetadataValue::Null => write!(f, "<null>"),
        }
    }
}

impl MetadataValue {
    /// Try to interpret the value as an `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(v) => Some(*v),
            MetadataValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Interpret the value as an acquisition time in seconds since the epoch.
    ///
    /// Numbers are taken as epoch seconds, strings must be RFC 3339.
    pub fn as_timestamp(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(_) | MetadataValue::Integer(_) => self.as_f64(),
            MetadataValue::Date(s) | MetadataValue::String(s) => {
                chrono::DateTime::parse_from_rfc3339(s.trim())
                    .ok()
                    .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// Canonical form used when comparing configuration fields.
    ///
    /// Numbers collapse to a `Float` rounded to `decimals` places so that an
    /// integer `10`, a float `10.0` and a motor read-back `10.0000001` compare
    /// equal. Strings are trimmed.
    pub fn normalized(&self, decimals: u32) -> MetadataValue {
        match self {
            MetadataValue::Integer(_) | MetadataValue::Float(_) => {
                let v = self.as_f64().unwrap_or(f64::NAN);
                let scale = 10f64.powi(decimals as i32);
                let rounded = (v * scale).round() / scale;
                // -0.0 and 0.0 must land in the same bucket
                MetadataValue::Float(if rounded == 0.0 { 0.0 } else { rounded })
            }
            MetadataValue::String(s) => MetadataValue::String(s.trim().to_string()),
            MetadataValue::Date(s) => MetadataValue::Date(s.trim().to_string()),
            other => other.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Calibration kinds
// ---------------------------------------------------------------------------

/// The two calibration frame families paired with a sample batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CalibrationKind {
    /// Open beam: detector response without sample.
    OpenBeam,
    /// Dark current: detector response with the beam shuttered.
    DarkCurrent,
}

impl fmt::Display for CalibrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationKind::OpenBeam => write!(f, "OB"),
            CalibrationKind::DarkCurrent => write!(f, "DC"),
        }
    }
}

// ---------------------------------------------------------------------------
// ImageRecord – one image file and its metadata
// ---------------------------------------------------------------------------

/// Metadata of a single image: key → value.
pub type AcquisitionMetadata = BTreeMap<String, MetadataValue>;

/// A single image file with the metadata read from its sidecar.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub metadata: AcquisitionMetadata,
}

// ---------------------------------------------------------------------------
// ImageBatch – a set of records read from one folder
// ---------------------------------------------------------------------------

/// Records of one folder, in path order.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub records: Vec<ImageRecord>,
}

impl ImageBatch {
    pub fn from_records(mut records: Vec<ImageRecord>) -> Self {
        records.sort_by(|a, b| a.path.cmp(&b.path));
        ImageBatch { records }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Earliest and latest acquisition time among `indices`, if any record
    /// carries a readable timestamp under `key`.
    pub fn acquisition_window(&self, key: &str, indices: &[usize]) -> Option<TimeWindow> {
        indices
            .iter()
            .filter_map(|&i| self.records.get(i))
            .filter_map(|rec| rec.metadata.get(key).and_then(MetadataValue::as_timestamp))
            .fold(None, |acc: Option<TimeWindow>, t| match acc {
                None => Some(TimeWindow { start: t, end: t }),
                Some(w) => Some(TimeWindow {
                    start: w.start.min(t),
                    end: w.end.max(t),
                }),
            })
    }
}

// ---------------------------------------------------------------------------
// Signature – hard-filter projection of a record
// ---------------------------------------------------------------------------

/// Normalized values of the configuration keys a calibration set must share
/// with the sample. Keys absent from the metadata are stored as `Null`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Signature(pub BTreeMap<String, MetadataValue>);

impl Signature {
    pub fn from_metadata(metadata: &AcquisitionMetadata, keys: &[String], decimals: u32) -> Self {
        Signature(
            keys.iter()
                .map(|k| {
                    let v = metadata
                        .get(k)
                        .map(|v| v.normalized(decimals))
                        .unwrap_or(MetadataValue::Null);
                    (k.clone(), v)
                })
                .collect(),
        )
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

// ---------------------------------------------------------------------------
// TimeWindow
// ---------------------------------------------------------------------------

/// Closed acquisition interval in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    /// Distance between two windows; zero when they overlap.
    pub fn gap(&self, other: &TimeWindow) -> f64 {
        if other.start > self.end {
            other.start - self.end
        } else if self.start > other.end {
            self.start - other.end
        } else {
            0.0
        }
    }
}
