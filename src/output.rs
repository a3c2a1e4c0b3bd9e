use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use image::{ImageBuffer, Luma};
use ndarray::Axis;
use serde::{Deserialize, Serialize};

use crate::pipeline::Volume;

/// Linear map applied to write floating point slices as 16-bit images:
/// `min` → 0, `max` → 65535.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityScale {
    pub min: f32,
    pub max: f32,
}

impl IntensityScale {
    /// Range of the finite values of `volume`; `None` if there are none.
    pub fn of(volume: &Volume) -> Option<Self> {
        volume
            .iter()
            .filter(|v| v.is_finite())
            .fold(None, |acc: Option<IntensityScale>, &v| match acc {
                None => Some(IntensityScale { min: v, max: v }),
                Some(s) => Some(IntensityScale {
                    min: s.min.min(v),
                    max: s.max.max(v),
                }),
            })
    }

    fn to_u16(self, v: f32) -> u16 {
        let span = self.max - self.min;
        if !v.is_finite() || span <= 0.0 {
            return 0;
        }
        let t = ((v - self.min) / span).clamp(0.0, 1.0);
        (t * f32::from(u16::MAX)).round() as u16
    }
}

/// Write every slice of `volume` along its first axis as
/// `<dir>/<prefix>_<index>.tiff`. Creates `dir` if needed.
pub fn write_slices(
    volume: &Volume,
    dir: &Path,
    prefix: &str,
    scale: IntensityScale,
) -> Result<Vec<PathBuf>> {
    let (_, rows, cols) = volume.dim();
    if rows == 0 || cols == 0 {
        bail!("cannot write an empty volume");
    }
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let mut written = Vec::with_capacity(volume.len_of(Axis(0)));
    for (i, slice) in volume.axis_iter(Axis(0)).enumerate() {
        let pixels: Vec<u16> = slice.iter().map(|&v| scale.to_u16(v)).collect();
        let buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_raw(cols as u32, rows as u32, pixels)
                .context("slice buffer does not match its dimensions")?;
        let path = dir.join(format!("{prefix}_{i:04}.tiff"));
        buffer
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

/// Pretty-printed JSON.
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(value).context("serializing report")?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn scale_ignores_non_finite_values() {
        let mut v = Array3::from_shape_fn((1, 2, 2), |(_, y, x)| (y * 2 + x) as f32);
        v[[0, 0, 0]] = f32::NAN;
        let s = IntensityScale::of(&v).unwrap();
        assert_eq!(s, IntensityScale { min: 1.0, max: 3.0 });
        assert_eq!(s.to_u16(1.0), 0);
        assert_eq!(s.to_u16(3.0), u16::MAX);
        assert_eq!(s.to_u16(f32::NAN), 0);
        assert!(IntensityScale::of(&Array3::from_elem((1, 1, 1), f32::NAN)).is_none());
    }

    #[test]
    fn slices_land_as_numbered_tiffs() {
        let dir = tempfile::tempdir().unwrap();
        let v = Array3::from_shape_fn((3, 2, 4), |(z, _, x)| (z * 4 + x) as f32);
        let scale = IntensityScale::of(&v).unwrap();
        let files = write_slices(&v, dir.path(), "recon", scale).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[2].ends_with("recon_0002.tiff"));

        let back = image::open(&files[2]).unwrap().into_luma16();
        assert_eq!(back.dimensions(), (4, 2));
        assert_eq!(back.get_pixel(3, 1)[0], u16::MAX);
    }

    #[test]
    fn json_report_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/run.json");
        write_json(&IntensityScale { min: 0.0, max: 1.0 }, &path).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("\"max\": 1.0"));
    }
}
