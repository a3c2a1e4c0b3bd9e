use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde_json::Value as JsonValue;

use super::model::{AcquisitionMetadata, MetadataValue};

/// Name of the per-directory metadata catalogue.
pub const CATALOG_FILE_NAME: &str = "metadata.csv";

/// Column of the catalogue holding the image file name.
pub const CATALOG_FILE_COLUMN: &str = "file";

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Metadata keyed by image file name, as read from one metadata file.
pub type MetadataTable = BTreeMap<String, AcquisitionMetadata>;

/// Load a metadata file.  Dispatch by extension.
///
/// Supported formats:
/// * `.json` – sidecar of a single image: `{ "ExposureTime": 30, ... }`.
///   The table holds one entry keyed by the image name (sidecar name minus
///   `.json`).
/// * `.csv`  – directory catalogue with a `file` column, one row per image
pub fn load_metadata_file(path: &Path) -> Result<MetadataTable> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "json" => {
            let image_name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("sidecar file name is not valid UTF-8")?
                .to_string();
            let metadata = load_json_sidecar(path)?;
            Ok(BTreeMap::from([(image_name, metadata)]))
        }
        "csv" => load_csv_catalog(path),
        other => bail!("Unsupported metadata file extension: .{other}"),
    }
}

/// Whether a file name looks like a projection/calibration image.
pub fn is_image_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".tif") || lower.ends_with(".tiff")
}

// ---------------------------------------------------------------------------
// JSON sidecar
// ---------------------------------------------------------------------------

/// Expected JSON schema, one flat object per image:
///
/// ```json
/// {
///   "ExposureTime": 30.0,
///   "MotSlitHR.RBV": 10.0,
///   "ModelStr": "iKon-L",
///   "TimeStamp": "2020-09-13T12:26:40Z"
/// }
/// ```
pub fn load_json_sidecar(path: &Path) -> Result<AcquisitionMetadata> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading sidecar {}", path.display()))?;
    let root: JsonValue = serde_json::from_str(&text)
        .with_context(|| format!("parsing sidecar {}", path.display()))?;

    let obj = root
        .as_object()
        .with_context(|| format!("{}: expected a JSON object", path.display()))?;

    Ok(obj
        .iter()
        .map(|(key, val)| (key.clone(), json_to_metadata(val)))
        .collect())
}

fn json_to_metadata(val: &JsonValue) -> MetadataValue {
    match val {
        JsonValue::String(s) => {
            if looks_like_date(s) {
                MetadataValue::Date(s.clone())
            } else {
                MetadataValue::String(s.clone())
            }
        }
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                MetadataValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                MetadataValue::Float(f)
            } else {
                MetadataValue::String(n.to_string())
            }
        }
        JsonValue::Bool(b) => MetadataValue::Bool(*b),
        JsonValue::Null => MetadataValue::Null,
        other => MetadataValue::String(other.to_string()),
    }
}

fn looks_like_date(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s.trim()).is_ok()
}

// ---------------------------------------------------------------------------
// CSV catalogue
// ---------------------------------------------------------------------------

/// CSV layout:  header row with key names.
/// The `file` column holds the image file name (no directory part).
/// All other columns are metadata; empty cells become `Null`.
pub fn load_csv_catalog(path: &Path) -> Result<MetadataTable> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening catalogue {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let file_idx = headers
        .iter()
        .position(|h| h == CATALOG_FILE_COLUMN)
        .with_context(|| format!("CSV missing '{CATALOG_FILE_COLUMN}' column"))?;

    let mut table = BTreeMap::new();

    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;

        let file = record.get(file_idx).unwrap_or("").trim();
        if file.is_empty() {
            bail!("CSV row {row_no}: empty '{CATALOG_FILE_COLUMN}' cell");
        }

        let mut metadata = BTreeMap::new();
        for (col_idx, value) in record.iter().enumerate() {
            if col_idx == file_idx {
                continue;
            }
            let Some(col_name) = headers.get(col_idx) else {
                continue;
            };
            metadata.insert(col_name.clone(), guess_metadata_type(value.trim()));
        }

        if table.insert(file.to_string(), metadata).is_some() {
            bail!("CSV row {row_no}: duplicate entry for '{file}'");
        }
    }

    Ok(table)
}

fn guess_metadata_type(s: &str) -> MetadataValue {
    if s.is_empty() {
        return MetadataValue::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return MetadataValue::Integer(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return MetadataValue::Float(f);
    }
    if s == "true" || s == "false" {
        return MetadataValue::Bool(s == "true");
    }
    if looks_like_date(s) {
        return MetadataValue::Date(s.to_string());
    }
    MetadataValue::String(s.to_string())
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// Read a single-frame image as a `rows × cols` array of detector counts.
pub fn read_image(path: &Path) -> Result<Array2<f32>> {
    let img = image::open(path)
        .with_context(|| format!("opening image {}", path.display()))?
        .into_luma16();
    let (width, height) = img.dimensions();
    let counts: Vec<f32> = img.into_raw().into_iter().map(f32::from).collect();
    Array2::from_shape_vec((height as usize, width as usize), counts)
        .with_context(|| format!("{}: unexpected pixel buffer size", path.display()))
}

/// Stack equally-sized frames into a `frames × rows × cols` array.
pub fn stack_frames(frames: &[Array2<f32>]) -> Result<Array3<f32>> {
    let Some(first) = frames.first() else {
        bail!("cannot build a stack from zero frames");
    };
    let shape = first.dim();
    if let Some((i, f)) = frames.iter().enumerate().find(|(_, f)| f.dim() != shape) {
        bail!("frame {i} is {:?}, expected {shape:?}", f.dim());
    }
    let views: Vec<ArrayView2<f32>> = frames.iter().map(|f| f.view()).collect();
    ndarray::stack(Axis(0), &views).context("stacking frames")
}
