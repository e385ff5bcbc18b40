use candle_core::{Device, Tensor, D};
use candle_nn::ops;
use unet::UNet;

use crate::{
    config::TrainingConfig,
    data::Batch,
    error::to_runtime_error,
    loss::PixelCrossEntropy,
    optimizer::{AdamWConfig, OptimizerState, StepStats, TrainerOptimizer, TrainerOptimizerOptions},
    TrainingError,
};

/// Result of one forward call.
#[derive(Debug)]
pub struct StepOutput {
    /// Mean pixel cross entropy of the batch.
    pub loss: f64,
    /// Softmax probabilities, `(batch, height, width, num_classes)`.
    pub prediction: Tensor,
    pub pixel_accuracy: f64,
    pub pixels: usize,
    pub correct_pixels: usize,
    /// Present only for training-mode calls.
    pub update: Option<StepStats>,
}

/// The network together with its loss and optimizer.
///
/// This is the only owner of the model state; the trainer mutates it solely
/// through [`SegmentationModel::forward`] with `training = true`.
pub struct SegmentationModel {
    network: UNet,
    optimizer: TrainerOptimizer,
    loss: PixelCrossEntropy,
}

impl SegmentationModel {
    pub fn new(config: &TrainingConfig, device: &Device) -> Result<Self, TrainingError> {
        let network = UNet::new(config.unet_config(device)).map_err(|err| {
            TrainingError::initialization(format!("failed to build network: {err}"))
        })?;
        let optimizer = TrainerOptimizer::new(
            network.trainable_parameters(),
            AdamWConfig::from(&config.optimizer),
            TrainerOptimizerOptions::from(&config.optimizer),
        )?;
        Ok(Self {
            network,
            optimizer,
            loss: PixelCrossEntropy::new(),
        })
    }

    pub fn network(&self) -> &UNet {
        &self.network
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn num_classes(&self) -> usize {
        self.network.config().num_classes
    }

    /// Runs the batch through the network. With `training` set, the loss is
    /// back-propagated and one optimizer step is applied before returning;
    /// otherwise parameters and running statistics are left untouched.
    pub fn forward(&mut self, batch: &Batch, training: bool) -> Result<StepOutput, TrainingError> {
        self.network.set_training(training);
        let logits = self.network.forward(&batch.inputs).map_err(to_runtime_error)?;
        let output = self.loss.compute(&logits, &batch.targets)?;

        let update = if training {
            let mut grads = output.loss.backward().map_err(to_runtime_error)?;
            Some(self.optimizer.step(&mut grads)?)
        } else {
            None
        };

        let prediction = ops::softmax(&logits.detach(), D::Minus1).map_err(to_runtime_error)?;
        let metrics = output.metrics;

        Ok(StepOutput {
            loss: f64::from(metrics.average_loss()),
            prediction,
            pixel_accuracy: f64::from(metrics.pixel_accuracy()),
            pixels: metrics.total_pixels(),
            correct_pixels: metrics.correct_pixels(),
            update,
        })
    }

    pub fn optimizer_state(&self) -> Result<OptimizerState, TrainingError> {
        self.optimizer.state()
    }

    pub fn load_optimizer_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.optimizer.load_state(state)
    }
}
