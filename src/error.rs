use std::path::PathBuf;

use thiserror::Error;

use crate::data::model::CalibrationKind;
use crate::pipeline::PipelineStage;

/// Result alias used across the crate.
pub type Result<T, E = RockitError> = std::result::Result<T, E>;

/// Every way a reconstruction run can fail. All of them abort the run.
#[derive(Debug, Error)]
pub enum RockitError {
    /// Missing or empty input folder.
    #[error("input error: {0}")]
    Input(String),

    /// Projection listing that cannot be indexed.
    #[error("format error: {0}")]
    Format(String),

    /// The acquired angles do not allow a 0°/180° pair.
    #[error("range error: {0}")]
    Range(String),

    #[error("invalid ROI: {0}")]
    Roi(String),

    #[error(
        "no matching {kind} under {root}: {candidates} candidate folder(s), \
         {compatible} with the sample configuration {signature}"
    )]
    NoMatch {
        kind: CalibrationKind,
        root: PathBuf,
        signature: String,
        candidates: usize,
        compatible: usize,
    },

    #[error("ambiguous {kind} match: {first} and {second} are equally close ({gap})")]
    AmbiguousMatch {
        kind: CalibrationKind,
        first: PathBuf,
        second: PathBuf,
        gap: String,
    },

    /// Sample files disagree on a configuration field.
    #[error("sample files disagree on '{key}': {first} vs {second}")]
    InconsistentSample {
        key: String,
        first: String,
        second: String,
    },

    #[error("cannot read metadata of {path}: {message}")]
    Metadata { path: PathBuf, message: String },

    /// A collaborator failed; carries its message verbatim.
    #[error(
        "stage '{stage}' failed (projections {proj_shape:?}, OB frames {ob_frames}, \
         DC frames {dc_frames}): {message}"
    )]
    Stage {
        stage: PipelineStage,
        message: String,
        proj_shape: (usize, usize, usize),
        ob_frames: usize,
        dc_frames: usize,
    },

    #[error("run cancelled before stage '{before}'")]
    Cancelled { before: PipelineStage },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("output error: {0}")]
    Output(String),
}
