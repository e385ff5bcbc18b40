use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{error::to_runtime_error, TrainingError};

/// Per-pixel softmax cross entropy against one-hot targets, averaged over
/// every pixel of the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct PixelCrossEntropy;

impl PixelCrossEntropy {
    pub fn new() -> Self {
        Self
    }

    /// `logits` and `targets` are both `(batch, height, width, classes)`.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() != 4 {
            return Err(TrainingError::runtime(format!(
                "pixel cross entropy expects (batch, height, width, classes) logits, got {:?}",
                dims
            )));
        }
        if targets.dims() != dims {
            return Err(TrainingError::runtime(format!(
                "target shape {:?} does not match logits shape {:?}",
                targets.dims(),
                dims
            )));
        }

        let num_classes = dims[3];
        let pixel_count: usize = dims[..3].iter().product();
        if pixel_count == 0 || num_classes == 0 {
            return Err(TrainingError::runtime("no pixels available for loss computation"));
        }

        let logits_flat = logits
            .reshape((pixel_count, num_classes))
            .map_err(to_runtime_error)?;
        let targets_flat = targets
            .to_device(logits.device())
            .and_then(|t| t.to_dtype(logits.dtype()))
            .and_then(|t| t.reshape((pixel_count, num_classes)))
            .map_err(to_runtime_error)?;

        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;
        let per_pixel = (&targets_flat * &log_probs)
            .and_then(|t| t.sum(D::Minus1))
            .and_then(|t| t.neg())
            .map_err(to_runtime_error)?;
        let loss = per_pixel.mean_all().map_err(to_runtime_error)?;
        let average_loss = loss
            .to_dtype(DType::F32)
            .and_then(|t| t.to_vec0::<f32>())
            .map_err(to_runtime_error)?;

        let predicted = logits_flat.argmax(D::Minus1).map_err(to_runtime_error)?;
        let expected = targets_flat.argmax(D::Minus1).map_err(to_runtime_error)?;
        let correct_pixels = predicted
            .eq(&expected)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.sum_all())
            .and_then(|t| t.to_vec0::<f32>())
            .map_err(to_runtime_error)?
            .round() as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                total_pixels: pixel_count,
                correct_pixels,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    total_pixels: usize,
    correct_pixels: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total_pixels(&self) -> usize {
        self.total_pixels
    }

    pub fn correct_pixels(&self) -> usize {
        self.correct_pixels
    }

    pub fn pixel_accuracy(&self) -> f32 {
        if self.total_pixels == 0 {
            0.0
        } else {
            self.correct_pixels as f32 / self.total_pixels as f32
        }
    }
}
