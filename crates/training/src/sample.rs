//! Label maps derived from predictions and their PNG encoding.

use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::{DType, IndexOp, Tensor};
use image::{GrayImage, ImageFormat};

use crate::{error::to_runtime_error, TrainingError};

/// Per-pixel class indices for one image, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    pub width: usize,
    pub height: usize,
    pub labels: Vec<u32>,
}

impl LabelMap {
    /// Arg-max over the class dimension of the last sample in a
    /// `(batch, height, width, classes)` prediction. Ties go to the lowest
    /// class index.
    pub fn from_prediction(prediction: &Tensor) -> Result<Self, TrainingError> {
        let (batch, height, width, classes) = prediction.dims4().map_err(to_runtime_error)?;
        if batch == 0 || classes == 0 {
            return Err(TrainingError::runtime(format!(
                "cannot derive a label map from prediction of shape {:?}",
                prediction.dims()
            )));
        }

        let scores = prediction
            .i(batch - 1)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(to_runtime_error)?;

        let labels = scores
            .chunks_exact(classes)
            .map(|pixel| {
                let mut best = 0usize;
                for (class, &score) in pixel.iter().enumerate().skip(1) {
                    if score > pixel[best] {
                        best = class;
                    }
                }
                best as u32
            })
            .collect();

        Ok(Self {
            width,
            height,
            labels,
        })
    }

    /// Spreads class indices over `0..=255` so the map is visible as an
    /// image: class `c` becomes `c * 255 / (num_classes - 1)`.
    pub fn to_intensity(&self, num_classes: usize) -> Vec<u8> {
        let top = num_classes.saturating_sub(1).max(1) as u32;
        self.labels
            .iter()
            .map(|&label| (label.min(top) * 255 / top) as u8)
            .collect()
    }
}

/// Writes per-epoch validation samples as 8-bit grayscale PNGs.
#[derive(Debug, Clone)]
pub struct SampleWriter {
    directory: PathBuf,
    num_classes: usize,
}

impl SampleWriter {
    pub fn new(directory: impl Into<PathBuf>, num_classes: usize) -> Self {
        Self {
            directory: directory.into(),
            num_classes,
        }
    }

    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.directory.join(format!("epoch_{epoch}.png"))
    }

    pub fn write_epoch(&self, label_map: &LabelMap, epoch: usize) -> Result<PathBuf, TrainingError> {
        let path = self.epoch_path(epoch);
        self.write(label_map, &path)?;
        Ok(path)
    }

    /// Reduces a network output to its label map and writes it for `epoch`.
    /// A prediction that cannot be reduced is reported as an image write failure.
    pub fn write_prediction(&self, prediction: &Tensor, epoch: usize) -> Result<PathBuf, TrainingError> {
        let label_map = LabelMap::from_prediction(prediction)
            .map_err(|err| TrainingError::image_write(self.epoch_path(epoch), err.to_string()))?;
        self.write_epoch(&label_map, epoch)
    }

    pub fn write(&self, label_map: &LabelMap, path: &Path) -> Result<(), TrainingError> {
        let fail = |reason: String| TrainingError::image_write(path, reason);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| fail(err.to_string()))?;
        }

        let width = u32::try_from(label_map.width).map_err(|err| fail(err.to_string()))?;
        let height = u32::try_from(label_map.height).map_err(|err| fail(err.to_string()))?;
        let image = GrayImage::from_raw(width, height, label_map.to_intensity(self.num_classes))
            .ok_or_else(|| {
                fail(format!(
                    "{} labels do not fill a {}x{} image",
                    label_map.labels.len(),
                    width,
                    height
                ))
            })?;
        image
            .save_with_format(path, ImageFormat::Png)
            .map_err(|err| fail(err.to_string()))
    }
}
