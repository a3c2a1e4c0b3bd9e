//! End-to-end run: index the sample folder, match calibration, load the
//! stacks and hand them to the stage runner.

use std::path::{Path, PathBuf};
use std::time::Instant;

use log::info;
use rayon::prelude::*;
use serde::Serialize;

use crate::context::{Diagnostics, RunContext};
use crate::data::loader::{is_image_file, stack_frames};
use crate::data::snapshot::FsSnapshot;
use crate::error::{Result, RockitError};
use crate::indexer::{ProjectionIndexer, find_proj180_ind};
use crate::matcher::{CalibrationMatcher, MatchDiagnostics};
use crate::output::{self, IntensityScale};
use crate::pipeline::{Collaborators, ImageStack, StackState, StageInputs, StageRunner, Volume};

/// Audit record written next to the reconstruction.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub ipts: String,
    pub experiment_root: PathBuf,
    pub input_folder: PathBuf,
    pub base_name: String,
    pub calibration: MatchDiagnostics,
    pub diagnostics: Diagnostics,
    /// `[slices, rows, cols]`.
    pub volume_shape: [usize; 3],
    pub intensity: Option<IntensityScale>,
    pub slices: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct RunOutput {
    pub volume: Volume,
    pub report: RunReport,
}

impl RunOutput {
    /// Write slices to `output_dir` and the report to `report_path`, each
    /// when set. Slice paths are added to the report before it is written.
    pub fn write(&mut self, output_dir: Option<&Path>, report_path: Option<&Path>) -> Result<()> {
        if let Some(dir) = output_dir {
            let scale = self.report.intensity.ok_or_else(|| {
                RockitError::Output("volume holds no finite value to scale".to_string())
            })?;
            info!("writing slices to {}", dir.display());
            self.report.slices =
                output::write_slices(&self.volume, dir, &self.report.base_name, scale)
                    .map_err(|e| RockitError::Output(format!("{e:#}")))?;
        }
        if let Some(path) = report_path {
            output::write_json(&self.report, path)
                .map_err(|e| RockitError::Output(format!("{e:#}")))?;
            info!("run report written to {}", path.display());
        }
        Ok(())
    }
}

/// Run the standard stage list.
pub fn run_reconstruction<S: FsSnapshot + ?Sized>(
    snapshot: &S,
    collaborators: &dyn Collaborators,
    ctx: &mut RunContext,
) -> Result<RunOutput> {
    run_reconstruction_with(&StageRunner::default(), snapshot, collaborators, ctx)
}

pub fn run_reconstruction_with<S: FsSnapshot + ?Sized>(
    runner: &StageRunner,
    snapshot: &S,
    collaborators: &dyn Collaborators,
    ctx: &mut RunContext,
) -> Result<RunOutput> {
    let config = ctx.config().clone();
    let settings = &config.settings;
    settings.roi.validate()?;

    let folder = config.input_folder.as_path();
    info!("working with IPTS-{}", config.ipts);
    info!("input folder: {}", folder.display());
    if !snapshot.exists(folder) {
        return Err(RockitError::Input(format!(
            "input folder {} does not exist",
            folder.display()
        )));
    }

    // -- index ---------------------------------------------------------------
    let started = Instant::now();
    let listing = snapshot.list_dir(folder).map_err(|e| {
        RockitError::Input(format!("cannot list {}: {e:#}", folder.display()))
    })?;
    let names: Vec<&str> = listing
        .iter()
        .filter(|e| !e.is_dir && is_image_file(e.name()))
        .map(|e| e.name())
        .collect();
    if names.is_empty() {
        return Err(RockitError::Input(format!(
            "no image files in {}",
            folder.display()
        )));
    }
    info!("- found {} projection files", names.len());

    let index = ProjectionIndexer::new(&settings.profile.filename)?.index(&names)?;
    let proj180 = find_proj180_ind(&index.angles_deg)?;
    info!(
        "- 180° projection: index {proj180} at {}°",
        index.angles_deg[proj180]
    );
    {
        let d = ctx.diagnostics_mut();
        d.projections = index.len();
        d.proj180_index = Some(proj180);
        d.proj180_angle_deg = Some(index.angles_deg[proj180]);
    }
    ctx.record_timing("index", elapsed_ms(started));

    // -- calibration ---------------------------------------------------------
    info!("looking for matching ob and dc");
    let started = Instant::now();
    let sample_files: Vec<PathBuf> = index.files.iter().map(|f| folder.join(&f.name)).collect();
    let experiment_root = config.experiment_root();
    let matched = CalibrationMatcher::new(&settings.profile, snapshot)
        .match_calibration(&sample_files, &experiment_root)?;
    {
        let d = ctx.diagnostics_mut();
        d.matched_ob = matched.ob.len();
        d.matched_dc = matched.dc.len();
        d.ob_directory = Some(matched.diagnostics.ob.directory.clone());
        d.dc_directory = Some(matched.diagnostics.dc.directory.clone());
    }
    ctx.record_timing("calibration matching", elapsed_ms(started));

    // -- load ----------------------------------------------------------------
    let started = Instant::now();
    info!("loading projections");
    let proj = load_stack(snapshot, &sample_files)?;
    info!("loading ob");
    let ob = load_stack(snapshot, &matched.ob.files)?;
    info!("loading dc");
    let dc = load_stack(snapshot, &matched.dc.files)?;
    ctx.record_timing("load", elapsed_ms(started));

    // -- stages --------------------------------------------------------------
    let inputs = StageInputs {
        roi: settings.roi,
        proj180_index: proj180,
        theta: index.theta.clone(),
        params: settings.processing.clone(),
    };
    let volume = runner.run(StackState::new(proj, ob, dc), &inputs, collaborators, ctx)?;
    let (slices, rows, cols) = volume.dim();
    info!("reconstructed volume: {slices} × {rows} × {cols}");
    info!(
        "total time: {:.1} ms",
        ctx.diagnostics().timings.total_ms
    );

    let report = RunReport {
        ipts: config.ipts.clone(),
        experiment_root,
        input_folder: config.input_folder.clone(),
        base_name: index.base_name.clone(),
        calibration: matched.diagnostics,
        diagnostics: ctx.diagnostics().clone(),
        volume_shape: [slices, rows, cols],
        intensity: IntensityScale::of(&volume),
        slices: Vec::new(),
    };
    Ok(RunOutput { volume, report })
}

fn load_stack<S: FsSnapshot + ?Sized>(snapshot: &S, files: &[PathBuf]) -> Result<ImageStack> {
    let frames = files
        .par_iter()
        .map(|path| {
            snapshot.read_image(path).map_err(|e| {
                RockitError::Input(format!("cannot read image {}: {e:#}", path.display()))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    stack_frames(&frames).map_err(|e| RockitError::Format(format!("{e:#}")))
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
