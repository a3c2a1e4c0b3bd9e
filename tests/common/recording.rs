use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use ndarray::{Array2, Array3, ArrayView2};
use rockit::data::model::AcquisitionMetadata;
use rockit::data::snapshot::DirEntry;
use rockit::pipeline::{CornerBox, ImageStack, Volume};
use rockit::{Collaborators, FsSnapshot, MemorySnapshot};

/// Collaborators that pass stacks through untouched and log every call.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<&'static str>>,
    pairs: Mutex<Vec<(&'static str, f32, f32)>>,
}

impl RecordingBackend {
    pub const TILT: f64 = 0.3;
    pub const CENTER: f64 = 3.5;

    fn call(&self, name: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(name);
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn pair(&self, name: &'static str, i0: ArrayView2<'_, f32>, i180: ArrayView2<'_, f32>) {
        if let Ok(mut pairs) = self.pairs.lock() {
            pairs.push((name, i0[[0, 0]], i180[[0, 0]]));
        }
    }

    /// Top-left pixel of the two frames handed to the tilt and center calls.
    pub fn pairs(&self) -> Vec<(&'static str, f32, f32)> {
        self.pairs.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Collaborators for RecordingBackend {
    fn find_slit_corners(&self, _reference: ArrayView2<'_, f32>) -> Result<CornerBox> {
        self.call("find_slit_corners");
        Ok(CornerBox {
            x0: 0,
            y0: 0,
            x1: 2048,
            y1: 2048,
        })
    }
    fn crop(&self, stack: ImageStack, _bbox: &CornerBox) -> Result<ImageStack> {
        self.call("crop");
        Ok(stack)
    }
    fn remove_outliers(&self, stack: ImageStack, _threshold: f32) -> Result<ImageStack> {
        self.call("remove_outliers");
        Ok(stack)
    }
    fn normalize(
        &self,
        sample: ImageStack,
        _ob: &ImageStack,
        _dc: &ImageStack,
    ) -> Result<ImageStack> {
        self.call("normalize");
        Ok(sample)
    }
    fn normalize_background(&self, stack: ImageStack, _air_width: usize) -> Result<ImageStack> {
        self.call("normalize_background");
        Ok(stack)
    }
    fn minus_log(&self, stack: ImageStack) -> Result<ImageStack> {
        self.call("minus_log");
        Ok(stack)
    }
    fn remove_stripes(&self, stack: ImageStack) -> Result<ImageStack> {
        self.call("remove_stripes");
        Ok(stack)
    }
    fn calculate_tilt(&self, i0: ArrayView2<'_, f32>, i180: ArrayView2<'_, f32>) -> Result<f64> {
        self.call("calculate_tilt");
        self.pair("calculate_tilt", i0, i180);
        Ok(Self::TILT)
    }
    fn apply_tilt(&self, stack: ImageStack, _angle_deg: f64) -> Result<ImageStack> {
        self.call("apply_tilt");
        Ok(stack)
    }
    fn find_center(
        &self,
        i0: ArrayView2<'_, f32>,
        i180: ArrayView2<'_, f32>,
        _tol: f64,
    ) -> Result<f64> {
        self.call("find_center");
        self.pair("find_center", i0, i180);
        Ok(Self::CENTER)
    }
    fn reconstruct(&self, stack: &ImageStack, _theta: &[f64], _center: f64) -> Result<Volume> {
        self.call("reconstruct");
        let (_, rows, cols) = stack.dim();
        Ok(Array3::zeros((rows, cols, cols)))
    }
    fn circular_mask(&self, volume: Volume, _axis: usize, _ratio: f64) -> Result<Volume> {
        self.call("circular_mask");
        Ok(volume)
    }
}

/// Snapshot wrapper recording every path it is asked about.
pub struct CountingSnapshot {
    inner: MemorySnapshot,
    touched: Mutex<Vec<PathBuf>>,
}

impl CountingSnapshot {
    pub fn new(inner: MemorySnapshot) -> Self {
        Self {
            inner,
            touched: Mutex::new(Vec::new()),
        }
    }

    fn touch(&self, path: &Path) {
        if let Ok(mut touched) = self.touched.lock() {
            touched.push(path.to_path_buf());
        }
    }

    /// Paths queried below `prefix`.
    pub fn touched_under(&self, prefix: &Path) -> Vec<PathBuf> {
        self.touched
            .lock()
            .map(|t| t.iter().filter(|p| p.starts_with(prefix)).cloned().collect())
            .unwrap_or_default()
    }
}

impl FsSnapshot for CountingSnapshot {
    fn exists(&self, path: &Path) -> bool {
        self.touch(path);
        self.inner.exists(path)
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        self.touch(dir);
        self.inner.list_dir(dir)
    }

    fn read_metadata(&self, file: &Path) -> Result<AcquisitionMetadata> {
        self.touch(file);
        self.inner.read_metadata(file)
    }

    fn read_image(&self, file: &Path) -> Result<Array2<f32>> {
        self.touch(file);
        self.inner.read_image(file)
    }
}
