use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{error, info};

use rockit::config::{InstrumentProfile, Roi, RunConfig, RunSettings, load_settings};
use rockit::{BasicBackend, DiskSnapshot, RunContext, run_reconstruction};

#[derive(Parser, Debug)]
#[command(name = "rockit")]
#[command(about = "Automatic CT reconstruction of an IPTS projection folder")]
#[command(version)]
struct Cli {
    /// IPTS number of the experiment.
    ipts: String,

    /// Folder holding the sample projections.
    input_folder: PathBuf,

    /// Left edge of the region of interest (default 250).
    #[arg(long)]
    roi_xmin: Option<usize>,

    /// Top edge of the region of interest (default 600).
    #[arg(long)]
    roi_ymin: Option<usize>,

    /// Right edge of the region of interest, exclusive (default 1250).
    #[arg(long)]
    roi_xmax: Option<usize>,

    /// Bottom edge of the region of interest, exclusive (default 1300).
    #[arg(long)]
    roi_ymax: Option<usize>,

    /// JSON settings file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Folder holding the IPTS-<id> folders (default /HFIR/CG1D).
    #[arg(long)]
    instrument_root: Option<PathBuf>,

    /// Instrument preset: cg1d or aps1id.
    #[arg(long)]
    profile: Option<String>,

    /// Fail when two calibration folders are equally close to the sample.
    #[arg(long)]
    strict: bool,

    /// Ignore calibration folders acquired further than this from the sample (seconds).
    #[arg(long)]
    max_time_gap: Option<f64>,

    /// Write reconstructed slices as 16-bit TIFF files here.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Write the JSON run report here.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Append log records to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = settings_from(&cli)?;
    init_logging(settings.log_file.as_deref())?;

    let mut config = RunConfig::new(cli.ipts, cli.input_folder);
    config.settings = settings;
    let output_dir = config.settings.output_dir.clone();
    let report_path = config.settings.report_path.clone();

    let mut ctx = RunContext::new(config);
    let snapshot = DiskSnapshot::new();
    let mut output = match run_reconstruction(&snapshot, &BasicBackend, &mut ctx) {
        Ok(output) => output,
        Err(e) => {
            error!("{e}");
            return Err(e.into());
        }
    };
    output.write(output_dir.as_deref(), report_path.as_deref())?;

    let d = &output.report.diagnostics;
    info!(
        "done: {} projections, {} OB, {} DC, tilt {:?}°, center {:?}",
        d.projections, d.matched_ob, d.matched_dc, d.tilt_deg, d.rotation_center
    );
    Ok(())
}

/// Defaults, then the settings file, then command-line flags.
fn settings_from(cli: &Cli) -> Result<RunSettings> {
    let mut settings = match &cli.config {
        Some(path) => load_settings(path)?,
        None => RunSettings::default(),
    };

    if let Some(name) = &cli.profile {
        let Some(profile) = InstrumentProfile::preset(name) else {
            bail!("unknown instrument profile '{name}' (expected cg1d or aps1id)");
        };
        settings.profile = profile;
    }
    if cli.strict {
        settings.profile.strict = true;
    }
    if cli.max_time_gap.is_some() {
        settings.profile.max_time_gap_s = cli.max_time_gap;
    }
    if let Some(root) = &cli.instrument_root {
        settings.instrument_root = root.clone();
    }

    let base = settings.roi;
    settings.roi = Roi {
        xmin: cli.roi_xmin.unwrap_or(base.xmin),
        ymin: cli.roi_ymin.unwrap_or(base.ymin),
        xmax: cli.roi_xmax.unwrap_or(base.xmax),
        ymax: cli.roi_ymax.unwrap_or(base.ymax),
    };
    settings.roi.validate()?;

    if cli.output_dir.is_some() {
        settings.output_dir = cli.output_dir.clone();
    }
    if cli.report.is_some() {
        settings.report_path = cli.report.clone();
    }
    if cli.log_file.is_some() {
        settings.log_file = cli.log_file.clone();
    }
    Ok(settings)
}

/// `[LEVEL] - timestamp - message`, level `info` unless `RUST_LOG` says otherwise.
fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}] - {} - {}",
            record.level(),
            buf.timestamp(),
            record.args()
        )
    });
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}
