//! Projection folder indexing: angles from file names, angle ordering and the
//! 0°/180° pair.

use regex::Regex;
use serde::Serialize;

use crate::config::FilenameConvention;
use crate::data::loader::is_image_file;
use crate::error::{Result, RockitError};

/// One projection parsed from its file name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionFile {
    pub name: String,
    pub angle_deg: f64,
    pub acquisition_index: u32,
}

/// A projection folder ordered by increasing angle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionIndex {
    /// Common file name prefix of the series.
    pub base_name: String,
    /// Projections sorted by (angle, file name).
    pub files: Vec<ProjectionFile>,
    /// `files[i].angle_deg`.
    pub angles_deg: Vec<f64>,
    /// Angles in radians, same order.
    pub theta: Vec<f64>,
    /// `order[i]` is the position of `files[i]` among the image files of the
    /// input listing, in listing order.
    pub order: Vec<usize>,
}

impl ProjectionIndex {
    /// Acquisition indices in angle order.
    pub fn acquisition_indices(&self) -> Vec<u32> {
        self.files.iter().map(|f| f.acquisition_index).collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Parses projection file names with a [`FilenameConvention`].
#[derive(Debug, Clone)]
pub struct ProjectionIndexer {
    pattern: Regex,
}

impl ProjectionIndexer {
    pub fn new(convention: &FilenameConvention) -> Result<Self> {
        let pattern = Regex::new(convention.pattern())
            .map_err(|e| RockitError::Config(format!("invalid filename pattern: {e}")))?;
        let groups: Vec<&str> = pattern.capture_names().flatten().collect();
        let has_angle = groups.contains(&"angle")
            || (groups.contains(&"deg") && groups.contains(&"frac"));
        if !groups.contains(&"name") || !groups.contains(&"index") || !has_angle {
            return Err(RockitError::Config(format!(
                "filename pattern needs groups 'name', 'index' and 'angle' (or 'deg' + 'frac'), got {groups:?}"
            )));
        }
        Ok(Self { pattern })
    }

    /// Parse a single file name.
    pub fn parse(&self, name: &str) -> Result<(String, ProjectionFile)> {
        let caps = self.pattern.captures(name).ok_or_else(|| {
            RockitError::Format(format!(
                "'{name}' does not follow the projection naming convention"
            ))
        })?;

        let angle_text = match caps.name("angle") {
            Some(m) => m.as_str().to_string(),
            None => match (caps.name("deg"), caps.name("frac")) {
                (Some(d), Some(f)) => format!("{}.{}", d.as_str(), f.as_str()),
                _ => {
                    return Err(RockitError::Format(format!("'{name}': no angle in file name")));
                }
            },
        };
        let angle_deg: f64 = angle_text
            .parse()
            .map_err(|_| RockitError::Format(format!("'{name}': bad angle '{angle_text}'")))?;

        let index_text = caps.name("index").map(|m| m.as_str()).unwrap_or("");
        let acquisition_index: u32 = index_text.parse().map_err(|_| {
            RockitError::Format(format!("'{name}': bad acquisition index '{index_text}'"))
        })?;

        let base = caps.name("name").map(|m| m.as_str()).unwrap_or("").to_string();

        Ok((
            base,
            ProjectionFile {
                name: name.to_string(),
                angle_deg,
                acquisition_index,
            },
        ))
    }

    /// Index a raw directory listing. Non-image names are skipped.
    pub fn index<S: AsRef<str>>(&self, file_names: &[S]) -> Result<ProjectionIndex> {
        let images: Vec<&str> = file_names
            .iter()
            .map(AsRef::as_ref)
            .filter(|n| is_image_file(n))
            .collect();
        if images.is_empty() {
            return Err(RockitError::Format(format!(
                "no image files among {} listed entries",
                file_names.len()
            )));
        }

        let mut base_name: Option<String> = None;
        let mut parsed = Vec::with_capacity(images.len());
        for (pos, name) in images.iter().enumerate() {
            let (base, file) = self.parse(name)?;
            match &base_name {
                None => base_name = Some(base),
                Some(existing) if *existing != base => {
                    return Err(RockitError::Format(format!(
                        "projections from more than one series: '{existing}' and '{base}'"
                    )));
                }
                Some(_) => {}
            }
            parsed.push((pos, file));
        }

        parsed.sort_by(|(_, a), (_, b)| {
            a.angle_deg
                .total_cmp(&b.angle_deg)
                .then_with(|| a.name.cmp(&b.name))
        });

        let order = parsed.iter().map(|(pos, _)| *pos).collect();
        let files: Vec<ProjectionFile> = parsed.into_iter().map(|(_, f)| f).collect();
        let angles_deg: Vec<f64> = files.iter().map(|f| f.angle_deg).collect();
        let theta = angles_deg.iter().map(|a| a.to_radians()).collect();

        Ok(ProjectionIndex {
            base_name: base_name.unwrap_or_default(),
            files,
            angles_deg,
            theta,
            order,
        })
    }
}

/// Index of the projection closest to 180° past the first acquired angle.
///
/// Fails when fewer than two angles are given or when the acquired span falls
/// short of 180° by more than one mean angular step; exactly one step short is
/// accepted. Ties resolve to the lower index.
pub fn find_proj180_ind(angles: &[f64]) -> Result<usize> {
    if angles.len() < 2 {
        return Err(RockitError::Range(format!(
            "need at least two projections to find a 180° pair, got {}",
            angles.len()
        )));
    }
    let min = angles.iter().copied().fold(f64::INFINITY, f64::min);
    let max = angles.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    let step = span / (angles.len() - 1) as f64;
    // tolerance absorbs rounding in the mean step
    if span + step < 180.0 - 1e-9 {
        return Err(RockitError::Range(format!(
            "acquired angles {min:.3}°..{max:.3}° do not reach 180° past the start"
        )));
    }

    let target = min + 180.0;
    let mut best = 0;
    for (i, a) in angles.iter().enumerate() {
        if (a - target).abs() < (angles[best] - target).abs() {
            best = i;
        }
    }
    Ok(best)
}
