use std::path::{Path, PathBuf};

use ndarray::Array2;
use rockit::data::model::{AcquisitionMetadata, MetadataValue};
use rockit::{MemorySnapshot, RunConfig};

pub const ROOT: &str = "/HFIR/CG1D";
pub const IPTS: &str = "24680";

pub fn experiment() -> PathBuf {
    Path::new(ROOT).join(format!("IPTS-{IPTS}"))
}

pub fn sample_folder() -> PathBuf {
    experiment().join("raw/ct/sample")
}

pub fn config() -> RunConfig {
    RunConfig::new(IPTS, sample_folder())
}

/// CG1D metadata with the given exposure and epoch timestamp.
pub fn cg1d_metadata(exposure: f64, time: f64) -> AcquisitionMetadata {
    let mut m = AcquisitionMetadata::new();
    m.insert("ManufacturerStr".into(), MetadataValue::String("Andor".into()));
    m.insert("ModelStr".into(), MetadataValue::String("iKon-L".into()));
    m.insert("ExposureTime".into(), MetadataValue::Float(exposure));
    for key in ["MotSlitHR.RBV", "MotSlitHL.RBV", "MotSlitVT.RBV", "MotSlitVB.RBV"] {
        m.insert(key.into(), MetadataValue::Float(10.0));
    }
    m.insert("TimeStamp".into(), MetadataValue::Float(time));
    m
}

/// `<name>_<ddd>_<fff>_<iiii>.tiff` for an angle in degrees.
pub fn cg1d_name(base: &str, angle_deg: f64, index: usize) -> String {
    let millideg = (angle_deg * 1000.0).round() as u64;
    format!(
        "{base}_{:03}_{:03}_{:04}.tiff",
        millideg / 1000,
        millideg % 1000,
        index
    )
}

/// Evenly spaced angles from 0 to 180° inclusive.
pub fn half_turn(frames: usize) -> Vec<f64> {
    let step = 180.0 / (frames - 1) as f64;
    (0..frames).map(|i| i as f64 * step).collect()
}

/// Sample projections produced by `frame(angle)`, acquired from t = 1000 s on.
pub fn add_projections(
    fs: &mut MemorySnapshot,
    exposure: f64,
    angles: &[f64],
    mut frame: impl FnMut(f64) -> Array2<f32>,
) {
    for (i, &angle) in angles.iter().enumerate() {
        let path = sample_folder().join(cg1d_name("sample", angle, i + 1));
        fs.add_image(
            path,
            cg1d_metadata(exposure, 1000.0 + i as f64),
            frame(angle),
        );
    }
}

/// `count` calibration frames in `<experiment>/<dir>`, acquired at `time`.
pub fn add_calibration(
    fs: &mut MemorySnapshot,
    dir: &str,
    count: usize,
    exposure: f64,
    time: f64,
    image: &Array2<f32>,
) {
    for i in 0..count {
        let path = experiment().join(dir).join(format!("img_{:04}.tiff", i + 1));
        fs.add_image(path, cg1d_metadata(exposure, time), image.clone());
    }
}
