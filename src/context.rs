use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::pipeline::{CornerBox, PipelineStage};

// ---------------------------------------------------------------------------
// Timings
// ---------------------------------------------------------------------------

/// Timing entry describing a single step of the run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTiming {
    pub label: String,
    pub elapsed_ms: f64,
}

impl StageTiming {
    pub fn new(label: impl Into<String>, elapsed_ms: f64) -> Self {
        Self {
            label: label.into(),
            elapsed_ms,
        }
    }
}

/// Aggregated timing trace for the run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingBreakdown {
    pub total_ms: f64,
    pub stages: Vec<StageTiming>,
}

impl TimingBreakdown {
    pub fn push(&mut self, label: impl Into<String>, elapsed_ms: f64) {
        self.total_ms += elapsed_ms;
        self.stages.push(StageTiming::new(label, elapsed_ms));
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Audit record of one run, filled in as the run progresses.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub projections: usize,
    pub proj180_index: Option<usize>,
    pub proj180_angle_deg: Option<f64>,
    pub matched_ob: usize,
    pub matched_dc: usize,
    pub ob_directory: Option<PathBuf>,
    pub dc_directory: Option<PathBuf>,
    pub slit_box: Option<CornerBox>,
    pub roi_box: Option<CornerBox>,
    pub tilt_deg: Option<f64>,
    pub rotation_center: Option<f64>,
    /// Stages that finished, in execution order.
    pub completed: Vec<PipelineStage>,
    pub timings: TimingBreakdown,
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Configuration and diagnostics of a single run. Created at run start and
/// dropped at its end; nothing is shared between runs.
#[derive(Debug)]
pub struct RunContext {
    config: RunConfig,
    diagnostics: Diagnostics,
    cancel: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            diagnostics: Diagnostics::default(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    /// Flag a host can set to stop the run at the next stage boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Record a finished step and its duration.
    pub fn record_timing(&mut self, label: impl Into<String>, elapsed_ms: f64) {
        self.diagnostics.timings.push(label, elapsed_ms);
    }

    pub fn record_stage(&mut self, stage: PipelineStage, elapsed_ms: f64) {
        self.diagnostics.completed.push(stage);
        self.record_timing(stage.to_string(), elapsed_ms);
    }
}
