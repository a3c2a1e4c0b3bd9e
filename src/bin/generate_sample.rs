//! Writes a small synthetic IPTS tree in the CG1D layout:
//!
//! ```text
//! <root>/IPTS-<id>/raw/ct/phantom/phantom_<ddd>_<fff>_<iiii>.tiff   181 projections, 0–180°
//! <root>/IPTS-<id>/raw/ob/run_1/ob_<iiii>.tiff                      5 open beams
//! <root>/IPTS-<id>/raw/ob/run_2/ob_<iiii>.tiff                      5 open beams, other exposure
//! <root>/IPTS-<id>/raw/df/run_1/dc_<iiii>.tiff                      5 dark currents
//! ```
//!
//! Every image gets a `<image>.json` sidecar with the detector, slit and
//! exposure metadata the matcher compares.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use image::{ImageBuffer, Luma};
use serde_json::json;

const SIZE: u32 = 256;
const SLIT_LO: u32 = 32;
const SLIT_HI: u32 = 224;
const DARK_LEVEL: f64 = 100.0;
const BEAM_LEVEL: f64 = 10_000.0;
const START_EPOCH: i64 = 1_600_000_000;

#[derive(Parser, Debug)]
#[command(about = "Generate a synthetic CG1D-style experiment tree")]
struct Args {
    /// Instrument root to create the IPTS folder in.
    #[arg(long, default_value = "sample_data")]
    root: PathBuf,

    /// IPTS number.
    #[arg(long, default_value = "12345")]
    ipts: String,

    /// Number of projections spread evenly over 0–180°.
    #[arg(long, default_value_t = 181)]
    projections: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Seeded xoshiro256** source for the per-pixel counting noise, so a given
/// `--seed` always writes the same tree.
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

/// Cylinders of the phantom: (x, z, radius, attenuation per pixel), in
/// pixels from the rotation axis.
const PHANTOM: [(f64, f64, f64, f64); 3] = [
    (0.0, 0.0, 60.0, 0.004),
    (25.0, 10.0, 15.0, 0.02),
    (-30.0, -20.0, 10.0, 0.03),
];

/// Line integral of the phantom along detector column `u` at angle `theta`.
fn path_attenuation(u: f64, theta: f64) -> f64 {
    let (sin, cos) = theta.sin_cos();
    PHANTOM
        .iter()
        .map(|&(x, z, r, mu)| {
            let d = u - (x * cos + z * sin);
            if d.abs() < r {
                2.0 * (r * r - d * d).sqrt() * mu
            } else {
                0.0
            }
        })
        .sum()
}

fn in_slits(x: u32, y: u32) -> bool {
    (SLIT_LO..SLIT_HI).contains(&x) && (SLIT_LO..SLIT_HI).contains(&y)
}

fn frame(
    rng: &mut SimpleRng,
    theta: Option<f64>,
    beam: f64,
) -> ImageBuffer<Luma<u16>, Vec<u16>> {
    let axis = (SIZE as f64 - 1.0) / 2.0;
    ImageBuffer::from_fn(SIZE, SIZE, |x, y| {
        let open = in_slits(x, y) && beam > 0.0;
        let mut counts = DARK_LEVEL;
        if open {
            let transmission = match theta {
                // cylinders span the middle rows only
                Some(t) if (80..176).contains(&y) => {
                    (-path_attenuation(x as f64 - axis, t)).exp()
                }
                _ => 1.0,
            };
            counts += beam * transmission;
        }
        // shot noise: Gaussian approximation of Poisson counts
        let noisy = rng.gauss(counts, counts.sqrt()).clamp(0.0, u16::MAX as f64);
        Luma([noisy.round() as u16])
    })
}

fn metadata(exposure: f64, epoch: i64) -> Result<serde_json::Value> {
    let stamp = DateTime::<Utc>::from_timestamp(epoch, 0).context("timestamp out of range")?;
    Ok(json!({
        "ManufacturerStr": "Andor",
        "ModelStr": "iKon-L",
        "MotSlitHR.RBV": 12.5,
        "MotSlitHL.RBV": 12.5,
        "MotSlitVT.RBV": 8.0,
        "MotSlitVB.RBV": 8.0,
        "ExposureTime": exposure,
        "TimeStamp": stamp.to_rfc3339(),
    }))
}

fn write_image(
    path: &Path,
    image: &ImageBuffer<Luma<u16>, Vec<u16>>,
    meta: &serde_json::Value,
) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    let sidecar = PathBuf::from(format!("{}.json", path.display()));
    std::fs::write(&sidecar, serde_json::to_string_pretty(meta)?)
        .with_context(|| format!("writing {}", sidecar.display()))
}

fn write_calibration(
    rng: &mut SimpleRng,
    dir: &Path,
    prefix: &str,
    beam: f64,
    exposure: f64,
    epoch: i64,
) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    for i in 0..5 {
        let path = dir.join(format!("{prefix}_{:04}.tiff", i + 1));
        write_image(&path, &frame(rng, None, beam), &metadata(exposure, epoch + i)?)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut rng = SimpleRng::new(args.seed);
    let experiment = args.root.join(format!("IPTS-{}", args.ipts));
    let exposure = 30.0;

    let ct = experiment.join("raw/ct/phantom");
    std::fs::create_dir_all(&ct).with_context(|| format!("creating {}", ct.display()))?;
    let steps = args.projections.max(2) - 1;
    for i in 0..=steps {
        let angle = i as f64 * 180.0 / steps as f64;
        let millideg = (angle * 1000.0).round() as u64;
        let name = format!(
            "phantom_{:03}_{:03}_{:04}.tiff",
            millideg / 1000,
            millideg % 1000,
            i + 1
        );
        let image = frame(&mut rng, Some(angle.to_radians()), BEAM_LEVEL);
        let epoch = START_EPOCH + 600 + 40 * i as i64;
        write_image(&ct.join(name), &image, &metadata(exposure, epoch)?)?;
    }

    write_calibration(
        &mut rng,
        &experiment.join("raw/ob/run_1"),
        "ob",
        BEAM_LEVEL,
        exposure,
        START_EPOCH,
    )?;
    write_calibration(
        &mut rng,
        &experiment.join("raw/ob/run_2"),
        "ob",
        BEAM_LEVEL * 2.0,
        2.0 * exposure,
        START_EPOCH + 300,
    )?;
    write_calibration(
        &mut rng,
        &experiment.join("raw/df/run_1"),
        "dc",
        0.0,
        exposure,
        START_EPOCH + 60,
    )?;

    println!(
        "Wrote {} projections, 10 OB and 5 DC frames under {}",
        steps + 1,
        experiment.display()
    );
    println!(
        "Try: rockit {} {} --instrument-root {} {}",
        args.ipts,
        ct.display(),
        args.root.display(),
        "--roi-xmin 40 --roi-ymin 96 --roi-xmax 216 --roi-ymax 160"
    );
    Ok(())
}
