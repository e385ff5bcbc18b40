use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use candle_core::{Device, Tensor};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{
        self, CheckpointDescriptor, CheckpointManager, CheckpointSettings, LoadOutcome,
        SaveRequest,
    },
    data::{BatchSource, PassOrder, Split},
    logging::{Logger, LoggingSettings},
    metrics::{EvaluationMetrics, EvaluationSummary, TrainingMetrics},
    model::SegmentationModel,
    sample::SampleWriter,
    TrainingConfig, TrainingError,
};

/// What one epoch produced.
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub training_batches: usize,
    pub training_samples: usize,
    pub mean_training_loss: Option<f64>,
    pub validation_batches: usize,
    pub validation_samples: usize,
    pub validation_loss: f64,
    pub pixel_accuracy: f64,
    pub train_time: Duration,
    pub eval_time: Duration,
    pub checkpoint: Option<PathBuf>,
    pub sample: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub run_dir: PathBuf,
    pub epochs: Vec<EpochSummary>,
    /// The stop flag was raised before the last epoch finished.
    pub interrupted: bool,
}

impl TrainingReport {
    pub fn last_validation_loss(&self) -> Option<f64> {
        self.epochs.last().map(|epoch| epoch.validation_loss)
    }
}

struct TrainingPass {
    batches: usize,
    samples: usize,
    mean_loss: Option<f64>,
    elapsed: Duration,
}

struct ValidationPass {
    metrics: EvaluationMetrics,
    samples: usize,
    /// Prediction of the final batch of the pass, if any batch ran.
    last_prediction: Option<Tensor>,
    elapsed: Duration,
}

/// Drives epochs of training and validation over a fixed split.
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    split: Split,
    batches: BatchSource,
    model: SegmentationModel,
    checkpoints: CheckpointManager,
    samples: Option<SampleWriter>,
    logger: Logger,
    start_epoch: usize,
    global_step: usize,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;

        let device = config.runtime.device.resolve()?;
        if let Err(err) = device.set_seed(config.runtime.seed) {
            debug!("device rng not seeded: {err}");
        }

        let split = Split::load(
            &config.data.manifest,
            &config.data.image_column,
            config.data.validation_fraction,
            config.runtime.seed,
        )?;
        info!(
            training = split.training.len(),
            validation = split.validation.len(),
            manifest = %config.data.manifest.display(),
            "dataset split"
        );

        let batches = BatchSource::new(&config, device.clone())?;
        let model = SegmentationModel::new(&config, &device)?;

        let settings = CheckpointSettings::from_config(&config)?;
        let last_epoch = config.runtime.max_epochs.saturating_sub(1);
        let checkpoints =
            CheckpointManager::create(&config.runtime.checkpoint.directory, settings, last_epoch)
                .map_err(|err| {
                    TrainingError::initialization(format!("failed to open run directory: {err}"))
                })?;

        let samples = config
            .runtime
            .samples
            .enabled
            .then(|| SampleWriter::new(&config.runtime.samples.directory, model.num_classes()));
        let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging));

        info!(
            device = ?device,
            run_dir = %checkpoints.run_dir().display(),
            parameters = model.network().trainable_parameters().len(),
            "trainer initialized"
        );

        Ok(Self {
            config,
            device,
            split,
            batches,
            model,
            checkpoints,
            samples,
            logger,
            start_epoch: 0,
            global_step: 0,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn split(&self) -> &Split {
        &self.split
    }

    pub fn model(&self) -> &SegmentationModel {
        &self.model
    }

    pub fn run_dir(&self) -> &Path {
        self.checkpoints.run_dir()
    }

    /// First epoch the next call to [`Trainer::train`] will run.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Restores weights and optimizer moments from a snapshot directory, or
    /// from the newest snapshot when `path` is a run directory. Training
    /// continues with the epoch after the restored one.
    pub fn resume_from_path(&mut self, path: &Path) -> Result<CheckpointDescriptor, TrainingError> {
        let directory = if path.join("manifest.json").is_file() {
            path.to_path_buf()
        } else {
            checkpoint::latest_checkpoint(path)?
                .map(|descriptor| descriptor.directory)
                .ok_or_else(|| {
                    TrainingError::checkpoint_io(path, "no checkpoint found to resume from")
                })?
        };

        let outcome = checkpoint::load_checkpoint(&directory)?;
        let manifest = outcome.manifest.clone();
        self.apply_checkpoint(outcome)?;
        info!(
            epoch = manifest.epoch,
            path = %directory.display(),
            "resumed from checkpoint"
        );
        Ok(CheckpointDescriptor {
            directory,
            manifest,
        })
    }

    fn apply_checkpoint(&mut self, outcome: LoadOutcome) -> Result<(), TrainingError> {
        let LoadOutcome {
            manifest,
            optimizer_state,
            model_weights_path,
        } = outcome;

        if manifest.input_shape != self.config.data.input_shape {
            return Err(TrainingError::initialization(format!(
                "checkpoint was trained at input shape {}, config uses {}",
                manifest.input_shape, self.config.data.input_shape
            )));
        }
        if manifest.config_sha256 != self.checkpoints.settings().config_sha256 {
            warn!("resuming with a configuration that differs from the checkpoint's");
        }

        checkpoint::apply_model_weights(self.model.network(), &model_weights_path)?;
        self.global_step = optimizer_state.step;
        self.model.load_optimizer_state(optimizer_state)?;
        self.start_epoch = manifest.epoch + 1;
        Ok(())
    }

    pub fn train(&mut self) -> Result<TrainingReport, TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs the remaining epochs. `should_stop` is polled before every batch
    /// and every epoch; a raised flag ends the run cleanly at that boundary.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<TrainingReport, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let max_epochs = self.config.runtime.max_epochs;
        info!(
            start_epoch = self.start_epoch,
            max_epochs,
            training = self.split.training.len(),
            validation = self.split.validation.len(),
            batch_size = self.batches.batch_size(),
            learning_rate = self.model.optimizer().learning_rate(),
            "starting training"
        );

        let mut epochs = Vec::new();
        let mut interrupted = false;
        for epoch in self.start_epoch..max_epochs {
            if should_stop() {
                interrupted = true;
                break;
            }
            match self.run_epoch_with(epoch, &mut should_stop)? {
                Some(summary) => {
                    self.start_epoch = epoch + 1;
                    epochs.push(summary);
                }
                None => {
                    interrupted = true;
                    break;
                }
            }
        }

        if interrupted {
            warn!(completed = epochs.len(), "training interrupted");
        }
        self.logger.flush();

        Ok(TrainingReport {
            run_dir: self.checkpoints.run_dir().to_path_buf(),
            epochs,
            interrupted,
        })
    }

    /// Runs a single epoch: training pass, validation pass, sample image and
    /// checkpoint decision.
    pub fn run_epoch(&mut self, epoch: usize) -> Result<EpochSummary, TrainingError> {
        self.run_epoch_with(epoch, &mut || false)?
            .ok_or_else(|| TrainingError::runtime("epoch interrupted"))
    }

    /// Scores the current model on the validation identifiers without
    /// touching its parameters.
    pub fn evaluate(&mut self) -> Result<EvaluationSummary, TrainingError> {
        let pass = self
            .validation_pass(&mut || false)?
            .ok_or_else(|| TrainingError::runtime("evaluation interrupted"))?;
        pass.metrics.finalize(self.start_epoch)
    }

    fn run_epoch_with(
        &mut self,
        epoch: usize,
        should_stop: &mut dyn FnMut() -> bool,
    ) -> Result<Option<EpochSummary>, TrainingError> {
        let Some(training) = self.training_pass(epoch, should_stop)? else {
            return Ok(None);
        };
        self.logger
            .log_training_finished(epoch, training.elapsed, training.mean_loss);

        let Some(validation) = self.validation_pass(should_stop)? else {
            return Ok(None);
        };
        let ValidationPass {
            metrics,
            samples: validation_samples,
            last_prediction,
            elapsed: eval_time,
        } = validation;
        let summary = metrics.finalize(epoch)?;
        self.logger.log_validation(epoch, &summary, eval_time);

        let sample = match last_prediction {
            Some(prediction) => self.write_sample(epoch, &prediction)?,
            None => None,
        };
        let checkpoint = self.checkpoint(epoch, summary.average_loss)?;

        Ok(Some(EpochSummary {
            epoch,
            training_batches: training.batches,
            training_samples: training.samples,
            mean_training_loss: training.mean_loss,
            validation_batches: summary.batches,
            validation_samples,
            validation_loss: summary.average_loss,
            pixel_accuracy: summary.pixel_accuracy,
            train_time: training.elapsed,
            eval_time,
            checkpoint,
            sample,
        }))
    }

    fn training_pass(
        &mut self,
        epoch: usize,
        should_stop: &mut dyn FnMut() -> bool,
    ) -> Result<Option<TrainingPass>, TrainingError> {
        let order = if self.config.data.shuffle_training {
            PassOrder::Shuffled(self.config.runtime.seed.wrapping_add(epoch as u64))
        } else {
            PassOrder::Sequential
        };

        let mut metrics = TrainingMetrics::new();
        let mut samples = 0;
        let mut loader = self.batches.stream(&self.split.training, order);
        loop {
            if should_stop() {
                return Ok(None);
            }
            let Some(batch) = loader.next() else {
                break;
            };
            let batch = batch?;

            let output = self.model.forward(&batch, true)?;
            if !output.loss.is_finite() {
                return Err(TrainingError::runtime(format!(
                    "training loss became non-finite at epoch {epoch}, batch {}",
                    batch.index
                )));
            }

            samples += batch.len();
            self.global_step += 1;
            let snapshot = metrics.record_batch(batch.len(), output.loss);
            self.logger.log_training_batch(
                epoch,
                batch.index,
                self.global_step,
                &snapshot,
                output.update.as_ref(),
            );
        }

        Ok(Some(TrainingPass {
            batches: metrics.batches(),
            samples,
            mean_loss: metrics.mean_loss(),
            elapsed: metrics.elapsed(),
        }))
    }

    fn validation_pass(
        &mut self,
        should_stop: &mut dyn FnMut() -> bool,
    ) -> Result<Option<ValidationPass>, TrainingError> {
        let started = Instant::now();
        let mut metrics = EvaluationMetrics::default();
        let mut samples = 0;
        let mut last_prediction = None;

        let mut loader = self.batches.stream_validation(&self.split.validation);
        loop {
            if should_stop() {
                return Ok(None);
            }
            let Some(batch) = loader.next() else {
                break;
            };
            let batch = batch?;

            let output = self.model.forward(&batch, false)?;
            metrics.update(
                output.loss,
                output.pixels as u64,
                output.correct_pixels as u64,
            );
            samples += batch.len();
            last_prediction = Some(output.prediction);
        }

        Ok(Some(ValidationPass {
            metrics,
            samples,
            last_prediction,
            elapsed: started.elapsed(),
        }))
    }

    fn write_sample(
        &mut self,
        epoch: usize,
        prediction: &Tensor,
    ) -> Result<Option<PathBuf>, TrainingError> {
        let Some(writer) = self.samples.as_ref() else {
            return Ok(None);
        };
        match writer.write_prediction(prediction, epoch) {
            Ok(path) => {
                self.logger.log_sample(epoch, &path);
                Ok(Some(path))
            }
            Err(err) if err.is_recoverable() => {
                self.logger.log_recovered(epoch, &err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn checkpoint(
        &mut self,
        epoch: usize,
        validation_loss: f64,
    ) -> Result<Option<PathBuf>, TrainingError> {
        let request = SaveRequest {
            model: &self.model,
            validation_loss: Some(validation_loss),
        };
        match self.checkpoints.maybe_save(request, epoch) {
            Ok(Some(descriptor)) => {
                self.logger.log_checkpoint(&descriptor);
                Ok(Some(descriptor.directory))
            }
            Ok(None) => Ok(None),
            Err(err) if err.is_recoverable() => {
                self.logger.log_recovered(epoch, &err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
