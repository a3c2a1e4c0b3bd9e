use anyhow::{Context, Result, bail};
use ndarray::Axis;

use super::{
    Collaborators, DiagnosticKind, PipelineStage, StackState, StageDescriptor, StageInputs,
    StageOutput,
};

/// The standard reconstruction sequence.
pub fn standard_stages() -> Vec<StageDescriptor> {
    vec![
        StageDescriptor {
            stage: PipelineStage::SlitCrop,
            run: slit_crop,
            requires: Some(DiagnosticKind::SlitBox),
        },
        StageDescriptor {
            stage: PipelineStage::RoiCrop,
            run: roi_crop,
            requires: Some(DiagnosticKind::RoiBox),
        },
        StageDescriptor {
            stage: PipelineStage::OutlierRemoval,
            run: outlier_removal,
            requires: None,
        },
        StageDescriptor {
            stage: PipelineStage::Normalize,
            run: normalize,
            requires: None,
        },
        StageDescriptor {
            stage: PipelineStage::BeamCorrect,
            run: beam_correct,
            requires: None,
        },
        StageDescriptor {
            stage: PipelineStage::NegativeLog,
            run: negative_log,
            requires: None,
        },
        StageDescriptor {
            stage: PipelineStage::StripeRemoval,
            run: stripe_removal,
            requires: None,
        },
        StageDescriptor {
            stage: PipelineStage::TiltCorrect,
            run: tilt_correct,
            requires: Some(DiagnosticKind::TiltAngle),
        },
        StageDescriptor {
            stage: PipelineStage::CenterOfRotation,
            run: center_of_rotation,
            requires: Some(DiagnosticKind::RotationCenter),
        },
        StageDescriptor {
            stage: PipelineStage::Reconstruct,
            run: reconstruct,
            requires: None,
        },
        StageDescriptor {
            stage: PipelineStage::CircularMask,
            run: circular_mask,
            requires: None,
        },
    ]
}

// ---------------------------------------------------------------------------
// Stage bodies
// ---------------------------------------------------------------------------

fn slit_crop(
    state: &mut StackState,
    _inputs: &StageInputs,
    collab: &dyn Collaborators,
) -> Result<StageOutput> {
    if state.ob.dim().0 == 0 {
        bail!("no open-beam frame to detect the slits on");
    }
    let corners = collab.find_slit_corners(state.ob.index_axis(Axis(0), 0))?;
    state.proj = collab.crop(std::mem::take(&mut state.proj), &corners)?;
    state.ob = collab.crop(std::mem::take(&mut state.ob), &corners)?;
    state.dc = collab.crop(std::mem::take(&mut state.dc), &corners)?;
    state.slit_box = Some(corners);
    Ok(StageOutput::SlitBox(corners))
}

fn roi_crop(
    state: &mut StackState,
    inputs: &StageInputs,
    collab: &dyn Collaborators,
) -> Result<StageOutput> {
    let slit = state
        .slit_box
        .context("ROI crop needs the slit box; slit-crop did not run")?;
    let Some(bbox) = inputs.roi.within(&slit) else {
        bail!("ROI {:?} lies outside the slit opening {slit:?}", inputs.roi);
    };
    state.proj = collab.crop(std::mem::take(&mut state.proj), &bbox)?;
    state.ob = collab.crop(std::mem::take(&mut state.ob), &bbox)?;
    state.dc = collab.crop(std::mem::take(&mut state.dc), &bbox)?;
    Ok(StageOutput::RoiBox(bbox))
}

fn outlier_removal(
    state: &mut StackState,
    inputs: &StageInputs,
    collab: &dyn Collaborators,
) -> Result<StageOutput> {
    log::info!("- parameter used: {}", inputs.params.outlier_threshold);
    state.proj = collab.remove_outliers(
        std::mem::take(&mut state.proj),
        inputs.params.outlier_threshold,
    )?;
    Ok(StageOutput::Nothing)
}

fn normalize(
    state: &mut StackState,
    _inputs: &StageInputs,
    collab: &dyn Collaborators,
) -> Result<StageOutput> {
    // calibration stacks are not needed past this point
    let ob = std::mem::take(&mut state.ob);
    let dc = std::mem::take(&mut state.dc);
    state.proj = collab.normalize(std::mem::take(&mut state.proj), &ob, &dc)?;
    Ok(StageOutput::Nothing)
}

fn beam_correct(
    state: &mut StackState,
    inputs: &StageInputs,
    collab: &dyn Collaborators,
) -> Result<StageOutput> {
    log::info!("- air: {}", inputs.params.air_width);
    state.proj =
        collab.normalize_background(std::mem::take(&mut state.proj), inputs.params.air_width)?;
    Ok(StageOutput::Nothing)
}

fn negative_log(
    state: &mut StackState,
    _inputs: &StageInputs,
    collab: &dyn Collaborators,
) -> Result<StageOutput> {
    state.proj = collab.minus_log(std::mem::take(&mut state.proj))?;
    Ok(StageOutput::Nothing)
}

fn stripe_removal(
    state: &mut StackState,
    _inputs: &StageInputs,
    collab: &dyn Collaborators,
) -> Result<StageOutput> {
    state.proj = collab.remove_stripes(std::mem::take(&mut state.proj))?;
    Ok(StageOutput::Nothing)
}

fn check_pair(state: &StackState, inputs: &StageInputs) -> Result<()> {
    let frames = state.proj.dim().0;
    if inputs.proj180_index >= frames {
        bail!(
            "180° projection index {} is outside a stack of {frames} frames",
            inputs.proj180_index
        );
    }
    Ok(())
}

fn tilt_correct(
    state: &mut StackState,
    inputs: &StageInputs,
    collab: &dyn Collaborators,
) -> Result<StageOutput> {
    check_pair(state, inputs)?;
    let angle = collab.calculate_tilt(
        state.proj.index_axis(Axis(0), 0),
        state.proj.index_axis(Axis(0), inputs.proj180_index),
    )?;
    state.proj = collab.apply_tilt(std::mem::take(&mut state.proj), angle)?;
    Ok(StageOutput::TiltAngle(angle))
}

fn center_of_rotation(
    state: &mut StackState,
    inputs: &StageInputs,
    collab: &dyn Collaborators,
) -> Result<StageOutput> {
    check_pair(state, inputs)?;
    let center = collab.find_center(
        state.proj.index_axis(Axis(0), 0),
        state.proj.index_axis(Axis(0), inputs.proj180_index),
        inputs.params.center_tolerance,
    )?;
    state.center = Some(center);
    Ok(StageOutput::RotationCenter(center))
}

fn reconstruct(
    state: &mut StackState,
    inputs: &StageInputs,
    collab: &dyn Collaborators,
) -> Result<StageOutput> {
    let center = state
        .center
        .context("reconstruction needs a rotation center; center-of-rotation did not run")?;
    let frames = state.proj.dim().0;
    if inputs.theta.len() != frames {
        bail!(
            "{} angles for a stack of {frames} projections",
            inputs.theta.len()
        );
    }
    state.volume = Some(collab.reconstruct(&state.proj, &inputs.theta, center)?);
    Ok(StageOutput::Nothing)
}

fn circular_mask(
    state: &mut StackState,
    inputs: &StageInputs,
    collab: &dyn Collaborators,
) -> Result<StageOutput> {
    let volume = state
        .volume
        .take()
        .context("nothing to mask; reconstruct did not run")?;
    state.volume = Some(collab.circular_mask(
        volume,
        inputs.params.mask_axis,
        inputs.params.mask_ratio,
    )?);
    Ok(StageOutput::Nothing)
}
