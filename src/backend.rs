//! Plain reference implementation of the pipeline collaborators.
//!
//! Small textbook versions of each routine so the command-line tool runs
//! without an external numerical library: threshold slit detection, 3×3
//! median outliers, flat/dark normalization, linear air-column background,
//! column-mean stripe suppression, center-of-mass tilt, profile-matching
//! rotation center and Ram-Lak filtered back-projection.

use anyhow::{Result, bail, ensure};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use rayon::prelude::*;

use crate::pipeline::{Collaborators, CornerBox, ImageStack, Volume};

const EPS: f32 = 1e-6;

/// Reference collaborators. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicBackend;

impl Collaborators for BasicBackend {
    fn find_slit_corners(&self, reference: ArrayView2<'_, f32>) -> Result<CornerBox> {
        let (min, max) = reference
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        ensure!(max > min, "flat reference image, cannot locate the slits");
        let threshold = min + 0.5 * (max - min);

        let mut corners: Option<CornerBox> = None;
        for ((y, x), &v) in reference.indexed_iter() {
            if v <= threshold {
                continue;
            }
            corners = Some(match corners {
                None => CornerBox {
                    x0: x,
                    y0: y,
                    x1: x + 1,
                    y1: y + 1,
                },
                Some(b) => CornerBox {
                    x0: b.x0.min(x),
                    y0: b.y0.min(y),
                    x1: b.x1.max(x + 1),
                    y1: b.y1.max(y + 1),
                },
            });
        }
        corners.ok_or_else(|| anyhow::anyhow!("no open area found on the reference image"))
    }

    fn crop(&self, stack: ImageStack, bbox: &CornerBox) -> Result<ImageStack> {
        let (_, rows, cols) = stack.dim();
        ensure!(
            bbox.x0 < bbox.x1 && bbox.y0 < bbox.y1 && bbox.x1 <= cols && bbox.y1 <= rows,
            "crop box {bbox:?} does not fit a {rows}×{cols} frame"
        );
        Ok(stack
            .slice(s![.., bbox.y0..bbox.y1, bbox.x0..bbox.x1])
            .to_owned())
    }

    fn remove_outliers(&self, mut stack: ImageStack, threshold: f32) -> Result<ImageStack> {
        for mut frame in stack.axis_iter_mut(Axis(0)) {
            let median = median3x3(frame.view());
            Zip::from(&mut frame).and(&median).for_each(|v, &m| {
                if (*v - m).abs() > threshold {
                    *v = m;
                }
            });
        }
        Ok(stack)
    }

    fn normalize(
        &self,
        mut sample: ImageStack,
        ob: &ImageStack,
        dc: &ImageStack,
    ) -> Result<ImageStack> {
        let frame_dim = (sample.dim().1, sample.dim().2);
        let (Some(ob_mean), Some(dc_mean)) = (ob.mean_axis(Axis(0)), dc.mean_axis(Axis(0))) else {
            bail!("open-beam and dark-current stacks must not be empty");
        };
        ensure!(
            ob_mean.dim() == frame_dim && dc_mean.dim() == frame_dim,
            "calibration frames {:?}/{:?} do not match projections {frame_dim:?}",
            ob_mean.dim(),
            dc_mean.dim()
        );
        let denom = Zip::from(&ob_mean)
            .and(&dc_mean)
            .map_collect(|&o, &d| (o - d).max(EPS));
        for mut frame in sample.axis_iter_mut(Axis(0)) {
            Zip::from(&mut frame)
                .and(&dc_mean)
                .and(&denom)
                .for_each(|v, &d, &n| *v = (*v - d) / n);
        }
        Ok(sample)
    }

    fn normalize_background(&self, mut stack: ImageStack, air_width: usize) -> Result<ImageStack> {
        let cols = stack.dim().2;
        ensure!(
            air_width > 0 && 2 * air_width < cols,
            "air width {air_width} does not fit a frame {cols} pixels wide"
        );
        let span = (cols - 1).max(1) as f32;
        for mut frame in stack.axis_iter_mut(Axis(0)) {
            for mut row in frame.axis_iter_mut(Axis(0)) {
                let left = row.slice(s![..air_width]).mean().unwrap_or(1.0);
                let right = row.slice(s![cols - air_width..]).mean().unwrap_or(1.0);
                for (x, v) in row.iter_mut().enumerate() {
                    let air = left + (right - left) * x as f32 / span;
                    if air.abs() > EPS {
                        *v /= air;
                    }
                }
            }
        }
        Ok(stack)
    }

    fn minus_log(&self, mut stack: ImageStack) -> Result<ImageStack> {
        stack.mapv_inplace(|v| -v.max(EPS).ln());
        Ok(stack)
    }

    fn remove_stripes(&self, mut stack: ImageStack) -> Result<ImageStack> {
        // each detector row across all angles is a sinogram; a stripe is a
        // column offset that survives averaging over angles
        for mut sino in stack.axis_iter_mut(Axis(1)) {
            let Some(profile) = sino.mean_axis(Axis(0)) else {
                continue;
            };
            let smooth = moving_average(profile.view(), 5);
            let offset = &profile - &smooth;
            for mut proj in sino.axis_iter_mut(Axis(0)) {
                proj -= &offset;
            }
        }
        Ok(stack)
    }

    fn calculate_tilt(
        &self,
        image0: ArrayView2<'_, f32>,
        image180: ArrayView2<'_, f32>,
    ) -> Result<f64> {
        ensure!(
            image0.dim() == image180.dim(),
            "0° and 180° images differ in size"
        );
        // per row, the rotation axis sits halfway between the centers of mass
        let points: Vec<(f64, f64)> = image0
            .axis_iter(Axis(0))
            .zip(image180.axis_iter(Axis(0)))
            .enumerate()
            .filter_map(|(y, (r0, r180))| {
                let c0 = center_of_mass(r0)?;
                let c180 = center_of_mass(r180)?;
                Some((y as f64, 0.5 * (c0 + c180)))
            })
            .collect();
        ensure!(points.len() >= 2, "not enough attenuating rows to estimate tilt");
        let slope = fit_slope(&points);
        Ok(slope.atan().to_degrees())
    }

    fn apply_tilt(&self, mut stack: ImageStack, angle_deg: f64) -> Result<ImageStack> {
        if angle_deg == 0.0 {
            return Ok(stack);
        }
        let (sin, cos) = angle_deg.to_radians().sin_cos();
        for mut frame in stack.axis_iter_mut(Axis(0)) {
            let source = frame.to_owned();
            let (rows, cols) = source.dim();
            let cy = (rows as f64 - 1.0) / 2.0;
            let cx = (cols as f64 - 1.0) / 2.0;
            for ((y, x), v) in frame.indexed_iter_mut() {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                let sx = cx + dx * cos + dy * sin;
                let sy = cy - dx * sin + dy * cos;
                *v = bilinear(source.view(), sx, sy);
            }
        }
        Ok(stack)
    }

    fn find_center(
        &self,
        image0: ArrayView2<'_, f32>,
        image180: ArrayView2<'_, f32>,
        tolerance: f64,
    ) -> Result<f64> {
        ensure!(
            image0.dim() == image180.dim(),
            "0° and 180° images differ in size"
        );
        ensure!(tolerance > 0.0, "center tolerance must be positive");
        let p0 = image0.sum_axis(Axis(0));
        let flipped = image180.slice(s![.., ..;-1]).sum_axis(Axis(0));
        let width = p0.len();
        ensure!(width >= 4, "images too narrow to search a rotation center");

        // the mirrored 180° profile is the 0° profile shifted by 2c - (w - 1)
        let max_shift = width as f64 / 4.0;
        let steps = (max_shift / tolerance).floor() as i64;
        let mut best = (f64::INFINITY, 0.0);
        for k in -steps..=steps {
            let shift = k as f64 * tolerance;
            let err = profile_mismatch(p0.view(), flipped.view(), shift);
            if err < best.0 {
                best = (err, shift);
            }
        }
        Ok((best.1 + width as f64 - 1.0) / 2.0)
    }

    fn reconstruct(&self, stack: &ImageStack, theta: &[f64], center: f64) -> Result<Volume> {
        let (angles, rows, cols) = stack.dim();
        ensure!(theta.len() == angles, "{} angles for {angles} projections", theta.len());
        ensure!(angles > 0 && cols > 0, "empty projection stack");

        let kernel = ramlak_kernel(cols);
        let slices: Vec<Array2<f32>> = (0..rows)
            .into_par_iter()
            .map(|r| {
                let filtered = filter_sinogram(stack.index_axis(Axis(1), r), &kernel);
                backproject(filtered.view(), theta, center)
            })
            .collect();
        let views: Vec<ArrayView2<f32>> = slices.iter().map(|s| s.view()).collect();
        Ok(ndarray::stack(Axis(0), &views)?)
    }

    fn circular_mask(&self, mut volume: Volume, axis: usize, ratio: f64) -> Result<Volume> {
        ensure!(axis < 3, "mask axis {axis} out of range for a 3D volume");
        for mut slice in volume.axis_iter_mut(Axis(axis)) {
            let (a, b) = slice.dim();
            let ca = (a as f64 - 1.0) / 2.0;
            let cb = (b as f64 - 1.0) / 2.0;
            let radius = ratio * a.min(b) as f64 / 2.0;
            for ((i, j), v) in slice.indexed_iter_mut() {
                let di = i as f64 - ca;
                let dj = j as f64 - cb;
                if di * di + dj * dj > radius * radius {
                    *v = 0.0;
                }
            }
        }
        Ok(volume)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn median3x3(frame: ArrayView2<'_, f32>) -> Array2<f32> {
    let (rows, cols) = frame.dim();
    Array2::from_shape_fn((rows, cols), |(y, x)| {
        let mut window = [0f32; 9];
        let mut n = 0;
        for yy in y.saturating_sub(1)..(y + 2).min(rows) {
            for xx in x.saturating_sub(1)..(x + 2).min(cols) {
                window[n] = frame[[yy, xx]];
                n += 1;
            }
        }
        let w = &mut window[..n];
        w.sort_by(f32::total_cmp);
        w[n / 2]
    })
}

fn moving_average(profile: ArrayView1<'_, f32>, window: usize) -> Array1<f32> {
    let n = profile.len();
    let half = window / 2;
    Array1::from_shape_fn(n, |i| {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(n);
        profile.slice(s![lo..hi]).mean().unwrap_or(0.0)
    })
}

fn center_of_mass(row: ArrayView1<'_, f32>) -> Option<f64> {
    let (mass, moment) = row
        .iter()
        .enumerate()
        .fold((0.0f64, 0.0f64), |(m, mx), (x, &v)| {
            let w = v.max(0.0) as f64;
            (m + w, mx + w * x as f64)
        });
    (mass > 1e-9).then(|| moment / mass)
}

/// Least-squares slope of `y = a + b·x` over `(x, y)` points.
fn fit_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (sxy, sxx) = points.iter().fold((0.0, 0.0), |(sxy, sxx), &(x, y)| {
        (sxy + (x - mean_x) * (y - mean_y), sxx + (x - mean_x) * (x - mean_x))
    });
    if sxx == 0.0 { 0.0 } else { sxy / sxx }
}

fn bilinear(img: ArrayView2<'_, f32>, x: f64, y: f64) -> f32 {
    let (rows, cols) = img.dim();
    let (max_x, max_y) = ((cols - 1) as f64, (rows - 1) as f64);
    if x < -0.5 || y < -0.5 || x > max_x + 0.5 || y > max_y + 0.5 {
        return 0.0;
    }
    // within half a pixel of the border: replicate the edge
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(cols - 1);
    let y1 = (y0 + 1).min(rows - 1);
    let fx = (x - x0 as f64) as f32;
    let fy = (y - y0 as f64) as f32;
    let top = img[[y0, x0]] * (1.0 - fx) + img[[y0, x1]] * fx;
    let bottom = img[[y1, x0]] * (1.0 - fx) + img[[y1, x1]] * fx;
    top * (1.0 - fy) + bottom * fy
}

fn sample_linear(profile: ArrayView1<'_, f32>, t: f64) -> Option<f32> {
    let n = profile.len();
    if t < 0.0 || t > (n - 1) as f64 {
        return None;
    }
    let i = t.floor() as usize;
    let j = (i + 1).min(n - 1);
    let f = (t - i as f64) as f32;
    Some(profile[i] * (1.0 - f) + profile[j] * f)
}

/// Mean squared difference between `p0(x + shift)` and `p1(x)` on their overlap.
fn profile_mismatch(p0: ArrayView1<'_, f32>, p1: ArrayView1<'_, f32>, shift: f64) -> f64 {
    let (sum, count) = p1
        .iter()
        .enumerate()
        .filter_map(|(x, &b)| {
            sample_linear(p0, x as f64 + shift).map(|a| ((a - b) as f64).powi(2))
        })
        .fold((0.0, 0usize), |(s, c), e| (s + e, c + 1));
    if count == 0 { f64::INFINITY } else { sum / count as f64 }
}

/// Spatial Ram-Lak kernel, index `k` holds the tap at offset `k - (n - 1)`.
fn ramlak_kernel(n: usize) -> Array1<f32> {
    let half = n as i64 - 1;
    Array1::from_shape_fn(2 * n - 1, |k| {
        let offset = k as i64 - half;
        if offset == 0 {
            0.25
        } else if offset % 2 == 0 {
            0.0
        } else {
            let o = offset as f64;
            (-1.0 / (std::f64::consts::PI * std::f64::consts::PI * o * o)) as f32
        }
    })
}

fn filter_sinogram(sino: ArrayView2<'_, f32>, kernel: &Array1<f32>) -> Array2<f32> {
    let (angles, cols) = sino.dim();
    let half = cols - 1;
    let mut out = Array2::zeros((angles, cols));
    for (a, proj) in sino.axis_iter(Axis(0)).enumerate() {
        for x in 0..cols {
            let mut acc = 0.0f32;
            for (t, &p) in proj.iter().enumerate() {
                acc += p * kernel[x + half - t];
            }
            out[[a, x]] = acc;
        }
    }
    out
}

fn backproject(filtered: ArrayView2<'_, f32>, theta: &[f64], center: f64) -> Array2<f32> {
    let cols = filtered.dim().1;
    let mid = (cols as f64 - 1.0) / 2.0;
    let trig: Vec<(f64, f64)> = theta.iter().map(|t| t.sin_cos()).collect();
    let scale = (std::f64::consts::PI / theta.len() as f64) as f32;
    Array2::from_shape_fn((cols, cols), |(y, x)| {
        let dx = x as f64 - mid;
        let dy = mid - y as f64;
        let acc: f32 = filtered
            .axis_iter(Axis(0))
            .zip(&trig)
            .filter_map(|(proj, &(sin, cos))| sample_linear(proj, center + dx * cos + dy * sin))
            .sum();
        acc * scale
    })
}
