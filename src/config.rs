use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::RockitError;
use crate::pipeline::CornerBox;

// ---------------------------------------------------------------------------
// Region of interest
// ---------------------------------------------------------------------------

/// Crop box in detector pixel coordinates, `xmax`/`ymax` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub xmin: usize,
    pub ymin: usize,
    pub xmax: usize,
    pub ymax: usize,
}

impl Default for Roi {
    fn default() -> Self {
        Self {
            xmin: 250,
            ymin: 600,
            xmax: 1250,
            ymax: 1300,
        }
    }
}

impl Roi {
    /// Build a ROI where every bound is optional and falls back to its default.
    pub fn from_parts(
        xmin: Option<usize>,
        ymin: Option<usize>,
        xmax: Option<usize>,
        ymax: Option<usize>,
    ) -> crate::error::Result<Self> {
        let d = Roi::default();
        let roi = Roi {
            xmin: xmin.unwrap_or(d.xmin),
            ymin: ymin.unwrap_or(d.ymin),
            xmax: xmax.unwrap_or(d.xmax),
            ymax: ymax.unwrap_or(d.ymax),
        };
        roi.validate()?;
        Ok(roi)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.xmin >= self.xmax {
            return Err(RockitError::Roi(format!(
                "xmin ({}) must be smaller than xmax ({})",
                self.xmin, self.xmax
            )));
        }
        if self.ymin >= self.ymax {
            return Err(RockitError::Roi(format!(
                "ymin ({}) must be smaller than ymax ({})",
                self.ymin, self.ymax
            )));
        }
        Ok(())
    }

    /// The part of the ROI inside `slit`, in coordinates of the slit-cropped
    /// frame. `None` when they do not overlap.
    pub fn within(&self, slit: &CornerBox) -> Option<CornerBox> {
        let x0 = self.xmin.max(slit.x0);
        let y0 = self.ymin.max(slit.y0);
        let x1 = self.xmax.min(slit.x1);
        let y1 = self.ymax.min(slit.y1);
        (x0 < x1 && y0 < y1).then(|| CornerBox {
            x0: x0 - slit.x0,
            y0: y0 - slit.y0,
            x1: x1 - slit.x0,
            y1: y1 - slit.y0,
        })
    }
}

// ---------------------------------------------------------------------------
// Filename conventions
// ---------------------------------------------------------------------------

/// How the rotation angle and acquisition index are encoded in projection
/// file names. Patterns are case-insensitive regexes with the named groups
/// `name`, `index` and either `angle` or `deg` + `frac`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilenameConvention {
    /// HFIR/CG1D: `<name>_<ddd>_<fff>_<iiii>.tiff`, angle `ddd.fff`.
    Cg1d,
    /// APS-1ID: `<name>_<iiiii>_<angle>.tif`, decimal angle.
    Aps1id,
    Custom { pattern: String },
}

impl FilenameConvention {
    pub fn pattern(&self) -> &str {
        match self {
            FilenameConvention::Cg1d => {
                r"(?i)^(?P<name>.+)_(?P<deg>\d{3})_(?P<frac>\d{3})_(?P<index>\d{4})\.tiff?$"
            }
            FilenameConvention::Aps1id => {
                r"(?i)^(?P<name>.+?)_(?P<index>\d{5})_(?P<angle>-?\d+(?:\.\d+)?)\.tiff?$"
            }
            FilenameConvention::Custom { pattern } => pattern,
        }
    }
}

// ---------------------------------------------------------------------------
// Instrument profile: where calibration lives and what must match
// ---------------------------------------------------------------------------

/// Directory conventions and matching policy of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentProfile {
    pub filename: FilenameConvention,
    /// Open-beam subtrees, relative to the experiment root.
    pub ob_dirs: Vec<PathBuf>,
    /// Dark-current subtrees, relative to the experiment root.
    pub dc_dirs: Vec<PathBuf>,
    /// How deep below a subtree root candidate folders are searched.
    pub max_depth: usize,
    /// Keys an OB set must share with the sample.
    pub ob_keys: Vec<String>,
    /// Keys a DC set must share with the sample.
    pub dc_keys: Vec<String>,
    /// Key holding the acquisition time (epoch seconds or RFC 3339).
    pub timestamp_key: String,
    /// Decimals kept when comparing numeric configuration values.
    pub float_decimals: u32,
    /// Drop candidates acquired further than this from the sample window.
    pub max_time_gap_s: Option<f64>,
    /// Fail instead of picking when the two best candidates tie.
    pub strict: bool,
}

impl Default for InstrumentProfile {
    fn default() -> Self {
        Self::cg1d()
    }
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl InstrumentProfile {
    /// HFIR CG1D imaging beamline.
    pub fn cg1d() -> Self {
        let detector = ["ManufacturerStr", "ModelStr"];
        let slits = ["MotSlitHR.RBV", "MotSlitHL.RBV", "MotSlitVT.RBV", "MotSlitVB.RBV"];
        let exposure = "ExposureTime";
        Self {
            filename: FilenameConvention::Cg1d,
            ob_dirs: vec![PathBuf::from("raw/ob")],
            dc_dirs: vec![PathBuf::from("raw/df")],
            max_depth: 3,
            ob_keys: keys(&[&detector[..], &slits[..], &[exposure][..]].concat()),
            dc_keys: keys(&[&detector[..], &[exposure][..]].concat()),
            timestamp_key: "TimeStamp".to_string(),
            float_decimals: 3,
            max_time_gap_s: None,
            strict: false,
        }
    }

    /// APS 1-ID style layout with aperture metadata.
    pub fn aps1id() -> Self {
        Self {
            filename: FilenameConvention::Aps1id,
            ob_dirs: vec![PathBuf::from("raw/flat")],
            dc_dirs: vec![PathBuf::from("raw/dark")],
            max_depth: 3,
            ob_keys: keys(&["camera", "binning", "slit_h", "slit_v", "exposure_time"]),
            dc_keys: keys(&["camera", "binning", "exposure_time"]),
            timestamp_key: "timestamp".to_string(),
            float_decimals: 3,
            max_time_gap_s: None,
            strict: false,
        }
    }

    /// Look up a preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cg1d" | "hfir" => Some(Self::cg1d()),
            "aps1id" | "aps-1id" | "aps" => Some(Self::aps1id()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingParams {
    /// Outlier removal: difference to the local median that flags a pixel.
    pub outlier_threshold: f32,
    /// Beam fluctuation correction: air columns taken on each side.
    pub air_width: usize,
    /// Center-of-rotation search resolution in pixels.
    pub center_tolerance: f64,
    /// Circular mask radius as a fraction of the half width.
    pub mask_ratio: f64,
    /// Axis of the volume along which slices are masked.
    pub mask_axis: usize,
}

impl Default for ProcessingParams {
    fn default() -> Self {
        Self {
            outlier_threshold: 50.0,
            air_width: 50,
            center_tolerance: 0.5,
            mask_ratio: 0.95,
            mask_axis: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Settings file and run configuration
// ---------------------------------------------------------------------------

/// Settings shared by runs, loadable from a JSON file. Every field is
/// optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Instrument folder holding the `IPTS-<id>` experiment folders.
    pub instrument_root: PathBuf,
    pub roi: Roi,
    pub profile: InstrumentProfile,
    pub processing: ProcessingParams,
    /// Where reconstructed slices are written; none disables writing.
    pub output_dir: Option<PathBuf>,
    /// Where the JSON run report is written.
    pub report_path: Option<PathBuf>,
    /// Log file opened in append mode; none logs to stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            instrument_root: PathBuf::from("/HFIR/CG1D"),
            roi: Roi::default(),
            profile: InstrumentProfile::default(),
            processing: ProcessingParams::default(),
            output_dir: None,
            report_path: None,
            log_file: None,
        }
    }
}

pub fn load_settings(path: &Path) -> Result<RunSettings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let settings: RunSettings = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    Ok(settings)
}

/// Everything one run needs. Passed explicitly; no process-wide state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// IPTS number of the experiment.
    pub ipts: String,
    /// Folder holding the sample projections.
    pub input_folder: PathBuf,
    pub settings: RunSettings,
}

impl RunConfig {
    pub fn new(ipts: impl Into<String>, input_folder: impl Into<PathBuf>) -> Self {
        Self {
            ipts: ipts.into(),
            input_folder: input_folder.into(),
            settings: RunSettings::default(),
        }
    }

    /// `<instrument_root>/IPTS-<id>`.
    pub fn experiment_root(&self) -> PathBuf {
        self.settings
            .instrument_root
            .join(format!("IPTS-{}", self.ipts))
    }
}
