use anyhow::Result;
use ndarray::{Array3, ArrayView2};
use serde::{Deserialize, Serialize};

/// Projection or calibration stack, `frames × rows × cols`.
pub type ImageStack = Array3<f32>;

/// Reconstructed volume, `slices × rows × cols`.
pub type Volume = Array3<f32>;

/// Axis-aligned pixel box, `x1`/`y1` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CornerBox {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
}

impl CornerBox {
    pub fn width(&self) -> usize {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> usize {
        self.y1.saturating_sub(self.y0)
    }
}

/// The numerical routines the pipeline delegates to. Implementations own the
/// algorithms; the pipeline only sequences the calls.
pub trait Collaborators {
    /// Locate the slit aperture on an open-beam frame.
    fn find_slit_corners(&self, reference: ArrayView2<'_, f32>) -> Result<CornerBox>;

    fn crop(&self, stack: ImageStack, bbox: &CornerBox) -> Result<ImageStack>;

    fn remove_outliers(&self, stack: ImageStack, threshold: f32) -> Result<ImageStack>;

    /// Flat/dark field normalization; output nominally in [0, 1].
    fn normalize(&self, sample: ImageStack, ob: &ImageStack, dc: &ImageStack)
        -> Result<ImageStack>;

    /// Beam fluctuation correction from the `air_width` columns on each side.
    fn normalize_background(&self, stack: ImageStack, air_width: usize) -> Result<ImageStack>;

    fn minus_log(&self, stack: ImageStack) -> Result<ImageStack>;

    /// Stripe (ring artifact) removal.
    fn remove_stripes(&self, stack: ImageStack) -> Result<ImageStack>;

    /// Tilt angle in degrees from the 0° and 180° projections.
    fn calculate_tilt(&self, image0: ArrayView2<'_, f32>, image180: ArrayView2<'_, f32>)
        -> Result<f64>;

    fn apply_tilt(&self, stack: ImageStack, angle_deg: f64) -> Result<ImageStack>;

    /// Rotation axis position, in pixels from the left edge.
    fn find_center(
        &self,
        image0: ArrayView2<'_, f32>,
        image180: ArrayView2<'_, f32>,
        tolerance: f64,
    ) -> Result<f64>;

    fn reconstruct(&self, stack: &ImageStack, theta: &[f64], center: f64) -> Result<Volume>;

    fn circular_mask(&self, volume: Volume, axis: usize, ratio: f64) -> Result<Volume>;
}
