//! Fixed-order correction pipeline.
//!
//! ```text
//!  Loaded ─slit-crop→ SlitCropped ─roi-crop→ RoiCropped ─outlier-removal→ OutlierCleaned
//!    ─normalize→ Normalized ─beam-correct→ BeamCorrected ─negative-log→ LogConverted
//!    ─stripe-removal→ StripeRemoved ─tilt-correct→ TiltCorrected
//!    ─center-of-rotation→ CenterFound ─reconstruct→ Reconstructed ─circular-mask→ Masked
//! ```

mod collaborators;
mod stages;

use std::fmt;
use std::time::Instant;

use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::config::{ProcessingParams, Roi};
use crate::context::RunContext;
use crate::error::{Result, RockitError};

pub use collaborators::{Collaborators, CornerBox, ImageStack, Volume};
pub use stages::standard_stages;

// ---------------------------------------------------------------------------
// Stages and states
// ---------------------------------------------------------------------------

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStage {
    SlitCrop,
    RoiCrop,
    OutlierRemoval,
    Normalize,
    BeamCorrect,
    NegativeLog,
    StripeRemoval,
    TiltCorrect,
    CenterOfRotation,
    Reconstruct,
    CircularMask,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 11] = [
        PipelineStage::SlitCrop,
        PipelineStage::RoiCrop,
        PipelineStage::OutlierRemoval,
        PipelineStage::Normalize,
        PipelineStage::BeamCorrect,
        PipelineStage::NegativeLog,
        PipelineStage::StripeRemoval,
        PipelineStage::TiltCorrect,
        PipelineStage::CenterOfRotation,
        PipelineStage::Reconstruct,
        PipelineStage::CircularMask,
    ];

    /// State reached once this stage has run.
    pub fn state_after(self) -> RunState {
        match self {
            PipelineStage::SlitCrop => RunState::SlitCropped,
            PipelineStage::RoiCrop => RunState::RoiCropped,
            PipelineStage::OutlierRemoval => RunState::OutlierCleaned,
            PipelineStage::Normalize => RunState::Normalized,
            PipelineStage::BeamCorrect => RunState::BeamCorrected,
            PipelineStage::NegativeLog => RunState::LogConverted,
            PipelineStage::StripeRemoval => RunState::StripeRemoved,
            PipelineStage::TiltCorrect => RunState::TiltCorrected,
            PipelineStage::CenterOfRotation => RunState::CenterFound,
            PipelineStage::Reconstruct => RunState::Reconstructed,
            PipelineStage::CircularMask => RunState::Masked,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PipelineStage::SlitCrop => "slit-crop",
            PipelineStage::RoiCrop => "roi-crop",
            PipelineStage::OutlierRemoval => "outlier-removal",
            PipelineStage::Normalize => "normalize",
            PipelineStage::BeamCorrect => "beam-correct",
            PipelineStage::NegativeLog => "negative-log",
            PipelineStage::StripeRemoval => "stripe-removal",
            PipelineStage::TiltCorrect => "tilt-correct",
            PipelineStage::CenterOfRotation => "center-of-rotation",
            PipelineStage::Reconstruct => "reconstruct",
            PipelineStage::CircularMask => "circular-mask",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Linear chain of run states; no backward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RunState {
    Loaded,
    SlitCropped,
    RoiCropped,
    OutlierCleaned,
    Normalized,
    BeamCorrected,
    LogConverted,
    StripeRemoved,
    TiltCorrected,
    CenterFound,
    Reconstructed,
    Masked,
}

// ---------------------------------------------------------------------------
// Shared run state
// ---------------------------------------------------------------------------

/// Image stacks threaded through the stages. Owned by a single run.
#[derive(Debug)]
pub struct StackState {
    pub state: RunState,
    pub proj: ImageStack,
    pub ob: ImageStack,
    pub dc: ImageStack,
    pub slit_box: Option<CornerBox>,
    pub center: Option<f64>,
    pub volume: Option<Volume>,
    ob_frames: usize,
    dc_frames: usize,
}

impl StackState {
    pub fn new(proj: ImageStack, ob: ImageStack, dc: ImageStack) -> Self {
        let ob_frames = ob.dim().0;
        let dc_frames = dc.dim().0;
        Self {
            state: RunState::Loaded,
            proj,
            ob,
            dc,
            slit_box: None,
            center: None,
            volume: None,
            ob_frames,
            dc_frames,
        }
    }
}

/// Values computed before the pipeline that some stages need.
#[derive(Debug, Clone)]
pub struct StageInputs {
    pub roi: Roi,
    /// Index of the 180° projection in the angle-ordered stack.
    pub proj180_index: usize,
    /// Projection angles in radians, stack order.
    pub theta: Vec<f64>,
    pub params: ProcessingParams,
}

/// Scalar result a stage hands back for the run diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageOutput {
    Nothing,
    SlitBox(CornerBox),
    RoiBox(CornerBox),
    TiltAngle(f64),
    RotationCenter(f64),
}

/// Diagnostic a stage is required to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    SlitBox,
    RoiBox,
    TiltAngle,
    RotationCenter,
}

impl StageOutput {
    fn provides(&self, kind: DiagnosticKind) -> bool {
        matches!(
            (self, kind),
            (StageOutput::SlitBox(_), DiagnosticKind::SlitBox)
                | (StageOutput::RoiBox(_), DiagnosticKind::RoiBox)
                | (StageOutput::TiltAngle(_), DiagnosticKind::TiltAngle)
                | (StageOutput::RotationCenter(_), DiagnosticKind::RotationCenter)
        )
    }
}

pub type StageFn =
    fn(&mut StackState, &StageInputs, &dyn Collaborators) -> anyhow::Result<StageOutput>;

/// One entry of the stage list.
#[derive(Clone, Copy)]
pub struct StageDescriptor {
    pub stage: PipelineStage,
    pub run: StageFn,
    pub requires: Option<DiagnosticKind>,
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("stage", &self.stage)
            .field("requires", &self.requires)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StageRunner
// ---------------------------------------------------------------------------

/// Runs a stage list in order and stops at the first failure.
#[derive(Debug)]
pub struct StageRunner {
    stages: Vec<StageDescriptor>,
}

impl Default for StageRunner {
    fn default() -> Self {
        Self {
            stages: standard_stages(),
        }
    }
}

impl StageRunner {
    /// Stages must appear in pipeline order; any may be left out.
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self> {
        if let Some(pair) = stages.windows(2).find(|w| w[0].stage >= w[1].stage) {
            return Err(RockitError::Config(format!(
                "stage '{}' cannot follow '{}'",
                pair[1].stage, pair[0].stage
            )));
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> impl Iterator<Item = PipelineStage> + '_ {
        self.stages.iter().map(|d| d.stage)
    }

    /// Run every stage and return the final volume.
    pub fn run(
        &self,
        mut state: StackState,
        inputs: &StageInputs,
        collaborators: &dyn Collaborators,
        ctx: &mut RunContext,
    ) -> Result<Volume> {
        for desc in &self.stages {
            if ctx.is_cancelled() {
                return Err(RockitError::Cancelled { before: desc.stage });
            }

            info!("{} ...", desc.stage);
            let started = Instant::now();
            let sizes = (state.proj.dim(), state.ob_frames, state.dc_frames);

            let output = (desc.run)(&mut state, inputs, collaborators)
                .map_err(|e| stage_error(desc.stage, format!("{e:#}"), sizes))?;

            if let Some(kind) = desc.requires {
                if !output.provides(kind) {
                    return Err(stage_error(
                        desc.stage,
                        format!("stage finished without the required {kind:?} diagnostic"),
                        sizes,
                    ));
                }
            }
            record_output(ctx, output);

            state.state = desc.stage.state_after();
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            ctx.record_stage(desc.stage, elapsed_ms);
            info!("{} ... Done! ({elapsed_ms:.1} ms)", desc.stage);
        }

        let last = self
            .stages
            .last()
            .map(|d| d.stage)
            .unwrap_or(PipelineStage::CircularMask);
        state.volume.take().ok_or_else(|| {
            stage_error(
                last,
                "pipeline finished without a reconstructed volume".to_string(),
                (state.proj.dim(), state.ob_frames, state.dc_frames),
            )
        })
    }
}

fn stage_error(
    stage: PipelineStage,
    message: String,
    (proj_shape, ob_frames, dc_frames): ((usize, usize, usize), usize, usize),
) -> RockitError {
    error!("{stage} failed: {message}");
    RockitError::Stage {
        stage,
        message,
        proj_shape,
        ob_frames,
        dc_frames,
    }
}

fn record_output(ctx: &mut RunContext, output: StageOutput) {
    let d = ctx.diagnostics_mut();
    match output {
        StageOutput::Nothing => {}
        StageOutput::SlitBox(b) => {
            info!("- slit corners: {b:?}");
            d.slit_box = Some(b);
        }
        StageOutput::RoiBox(b) => {
            info!("- corners detected are {b:?}");
            d.roi_box = Some(b);
        }
        StageOutput::TiltAngle(a) => {
            info!("- tilt angle: {a}");
            d.tilt_deg = Some(a);
        }
        StageOutput::RotationCenter(c) => {
            info!("- rotation center: {c}");
            d.rotation_center = Some(c);
        }
    }
}

#[cfg(test)]
mod tests;
