//! rockit: automatic CT reconstruction of neutron/X-ray projection folders.
//!
//! The run indexes a projection folder by angle, finds the open-beam and
//! dark-current frames taken with the same detector configuration, and
//! threads the stacks through a fixed-order correction pipeline whose
//! numerical steps are supplied through [`pipeline::Collaborators`].

pub mod backend;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod indexer;
pub mod matcher;
pub mod output;
pub mod pipeline;
pub mod run;

pub use backend::BasicBackend;
pub use config::{InstrumentProfile, ProcessingParams, Roi, RunConfig, RunSettings};
pub use context::{Diagnostics, RunContext};
pub use data::snapshot::{DiskSnapshot, FsSnapshot, MemorySnapshot};
pub use error::{Result, RockitError};
pub use matcher::{CalibrationMatcher, CalibrationSet, MatchResult};
pub use pipeline::{Collaborators, PipelineStage, StageRunner};
pub use run::{RunOutput, RunReport, run_reconstruction};
