use std::cell::RefCell;
use std::sync::atomic::Ordering;

use anyhow::{Result, bail};
use ndarray::{Array3, ArrayView2};

use super::*;
use crate::config::RunConfig;

/// Collaborator double: records call order, can fail on a named call.
#[derive(Default)]
struct Recorder {
    calls: RefCell<Vec<&'static str>>,
    /// Top-left pixel of the frames given to tilt and center.
    pairs: RefCell<Vec<(f32, f32)>>,
    fail_on: Option<&'static str>,
    slit: Option<CornerBox>,
}

impl Recorder {
    fn failing_on(name: &'static str) -> Self {
        Self {
            fail_on: Some(name),
            ..Default::default()
        }
    }

    fn call(&self, name: &'static str) -> Result<()> {
        self.calls.borrow_mut().push(name);
        if self.fail_on == Some(name) {
            bail!("{name} exploded");
        }
        Ok(())
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }
}

impl Collaborators for Recorder {
    fn find_slit_corners(&self, _reference: ArrayView2<'_, f32>) -> Result<CornerBox> {
        self.call("find_slit_corners")?;
        Ok(self.slit.unwrap_or(CornerBox {
            x0: 0,
            y0: 0,
            x1: 2048,
            y1: 2048,
        }))
    }
    fn crop(&self, stack: ImageStack, _bbox: &CornerBox) -> Result<ImageStack> {
        self.call("crop")?;
        Ok(stack)
    }
    fn remove_outliers(&self, stack: ImageStack, _threshold: f32) -> Result<ImageStack> {
        self.call("remove_outliers")?;
        Ok(stack)
    }
    fn normalize(
        &self,
        sample: ImageStack,
        _ob: &ImageStack,
        _dc: &ImageStack,
    ) -> Result<ImageStack> {
        self.call("normalize")?;
        Ok(sample)
    }
    fn normalize_background(&self, stack: ImageStack, _air_width: usize) -> Result<ImageStack> {
        self.call("normalize_background")?;
        Ok(stack)
    }
    fn minus_log(&self, stack: ImageStack) -> Result<ImageStack> {
        self.call("minus_log")?;
        Ok(stack)
    }
    fn remove_stripes(&self, stack: ImageStack) -> Result<ImageStack> {
        self.call("remove_stripes")?;
        Ok(stack)
    }
    fn calculate_tilt(&self, i0: ArrayView2<'_, f32>, i180: ArrayView2<'_, f32>) -> Result<f64> {
        self.call("calculate_tilt")?;
        self.pairs.borrow_mut().push((i0[[0, 0]], i180[[0, 0]]));
        Ok(0.25)
    }
    fn apply_tilt(&self, stack: ImageStack, _angle_deg: f64) -> Result<ImageStack> {
        self.call("apply_tilt")?;
        Ok(stack)
    }
    fn find_center(
        &self,
        i0: ArrayView2<'_, f32>,
        i180: ArrayView2<'_, f32>,
        _tol: f64,
    ) -> Result<f64> {
        self.call("find_center")?;
        self.pairs.borrow_mut().push((i0[[0, 0]], i180[[0, 0]]));
        Ok(3.5)
    }
    fn reconstruct(&self, stack: &ImageStack, _theta: &[f64], _center: f64) -> Result<Volume> {
        self.call("reconstruct")?;
        let (_, rows, cols) = stack.dim();
        Ok(Array3::zeros((rows, cols, cols)))
    }
    fn circular_mask(&self, volume: Volume, _axis: usize, _ratio: f64) -> Result<Volume> {
        self.call("circular_mask")?;
        Ok(volume)
    }
}

fn state(frames: usize) -> StackState {
    StackState::new(
        Array3::ones((frames, 4, 8)),
        Array3::ones((2, 4, 8)),
        Array3::zeros((2, 4, 8)),
    )
}

fn inputs(frames: usize) -> StageInputs {
    StageInputs {
        roi: Roi::default(),
        proj180_index: frames - 1,
        theta: (0..frames)
            .map(|i| (i as f64 * 180.0 / (frames - 1) as f64).to_radians())
            .collect(),
        params: ProcessingParams::default(),
    }
}

fn ctx() -> RunContext {
    RunContext::new(RunConfig::new("1", "/tmp/ct"))
}

#[test]
fn standard_run_visits_every_stage_in_order() {
    let collab = Recorder::default();
    let mut ctx = ctx();
    let volume = StageRunner::default()
        .run(state(5), &inputs(5), &collab, &mut ctx)
        .unwrap();

    assert_eq!(volume.dim(), (4, 8, 8));
    assert_eq!(
        collab.calls(),
        vec![
            "find_slit_corners",
            "crop",
            "crop",
            "crop",
            "crop",
            "crop",
            "crop",
            "remove_outliers",
            "normalize",
            "normalize_background",
            "minus_log",
            "remove_stripes",
            "calculate_tilt",
            "apply_tilt",
            "find_center",
            "reconstruct",
            "circular_mask",
        ]
    );
    let d = ctx.diagnostics();
    assert_eq!(d.completed, PipelineStage::ALL.to_vec());
    assert_eq!(d.tilt_deg, Some(0.25));
    assert_eq!(d.rotation_center, Some(3.5));
    assert_eq!(
        d.roi_box,
        Some(CornerBox {
            x0: 250,
            y0: 600,
            x1: 1250,
            y1: 1300
        })
    );
    assert_eq!(d.timings.stages.len(), PipelineStage::ALL.len());
}

#[test]
fn tilt_and_center_see_first_and_proj180_frames() {
    // every frame holds its own index; the 180° frame is not the last one
    let proj = Array3::from_shape_fn((6, 4, 8), |(i, _, _)| i as f32);
    let state = StackState::new(proj, Array3::ones((2, 4, 8)), Array3::zeros((2, 4, 8)));
    let mut inputs = inputs(6);
    inputs.proj180_index = 3;
    let collab = Recorder::default();

    StageRunner::default()
        .run(state, &inputs, &collab, &mut ctx())
        .unwrap();

    assert_eq!(*collab.pairs.borrow(), vec![(0.0, 3.0), (0.0, 3.0)]);
}

#[test]
fn failing_stage_stops_the_run() {
    let collab = Recorder::failing_on("normalize");
    let mut ctx = ctx();
    let err = StageRunner::default()
        .run(state(5), &inputs(5), &collab, &mut ctx)
        .unwrap_err();

    match err {
        RockitError::Stage {
            stage,
            message,
            proj_shape,
            ob_frames,
            dc_frames,
        } => {
            assert_eq!(stage, PipelineStage::Normalize);
            assert_eq!(message, "normalize exploded");
            assert_eq!(proj_shape, (5, 4, 8));
            assert_eq!((ob_frames, dc_frames), (2, 2));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(collab.calls().last(), Some(&"normalize"));
    assert!(!collab.calls().contains(&"normalize_background"));
    assert_eq!(
        ctx.diagnostics().completed,
        vec![
            PipelineStage::SlitCrop,
            PipelineStage::RoiCrop,
            PipelineStage::OutlierRemoval
        ]
    );
}

#[test]
fn stage_list_must_keep_pipeline_order() {
    let mut stages = standard_stages();
    stages.swap(3, 4);
    assert!(matches!(StageRunner::new(stages), Err(RockitError::Config(_))));

    let mut dup = standard_stages();
    dup.insert(1, dup[0]);
    assert!(StageRunner::new(dup).is_err());

    // leaving a stage out is allowed
    let mut fewer = standard_stages();
    fewer.retain(|d| d.stage != PipelineStage::StripeRemoval);
    let runner = StageRunner::new(fewer).unwrap();
    assert!(runner.stages().all(|s| s != PipelineStage::StripeRemoval));
}

fn silent_tilt(
    _state: &mut StackState,
    _inputs: &StageInputs,
    _collab: &dyn Collaborators,
) -> anyhow::Result<StageOutput> {
    Ok(StageOutput::Nothing)
}

#[test]
fn missing_required_diagnostic_is_a_stage_error() {
    let stages: Vec<StageDescriptor> = standard_stages()
        .into_iter()
        .map(|mut d| {
            if d.stage == PipelineStage::TiltCorrect {
                d.run = silent_tilt;
            }
            d
        })
        .collect();
    let collab = Recorder::default();
    let err = StageRunner::new(stages)
        .unwrap()
        .run(state(5), &inputs(5), &collab, &mut ctx())
        .unwrap_err();
    assert!(matches!(
        err,
        RockitError::Stage {
            stage: PipelineStage::TiltCorrect,
            ..
        }
    ));
    assert!(!collab.calls().contains(&"find_center"));
}

#[test]
fn cancellation_is_checked_at_stage_boundaries() {
    let collab = Recorder::default();
    let mut ctx = ctx();
    ctx.cancel_handle().store(true, Ordering::Relaxed);
    let err = StageRunner::default()
        .run(state(5), &inputs(5), &collab, &mut ctx)
        .unwrap_err();
    assert!(matches!(
        err,
        RockitError::Cancelled {
            before: PipelineStage::SlitCrop
        }
    ));
    assert!(collab.calls().is_empty());
}

#[test]
fn proj180_outside_stack_fails_tilt() {
    let collab = Recorder::default();
    let mut bad = inputs(5);
    bad.proj180_index = 9;
    let err = StageRunner::default()
        .run(state(5), &bad, &collab, &mut ctx())
        .unwrap_err();
    assert!(matches!(
        err,
        RockitError::Stage {
            stage: PipelineStage::TiltCorrect,
            ..
        }
    ));
    assert!(!collab.calls().contains(&"calculate_tilt"));
}

#[test]
fn roi_outside_slit_fails_roi_crop() {
    let collab = Recorder {
        slit: Some(CornerBox {
            x0: 0,
            y0: 0,
            x1: 100,
            y1: 100,
        }),
        ..Default::default()
    };
    let err = StageRunner::default()
        .run(state(5), &inputs(5), &collab, &mut ctx())
        .unwrap_err();
    assert!(matches!(
        err,
        RockitError::Stage {
            stage: PipelineStage::RoiCrop,
            ..
        }
    ));
}
