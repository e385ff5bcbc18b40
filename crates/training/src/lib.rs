//! Training and validation loop for U-Net image segmentation.
//!
//! A [`Trainer`] splits a manifest of image identifiers into training and
//! validation sets, streams resized image/mask batches through a
//! [`SegmentationModel`], and after every epoch writes a sample prediction and
//! (on a fixed cadence) a checkpoint snapshot.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod sample;
pub mod trainer;

pub use checkpoint::{CheckpointDescriptor, CheckpointManager, CheckpointSettings};
pub use config::TrainingConfig;
pub use data::{Batch, BatchSource, PassOrder, SampleId, Split};
pub use error::TrainingError;
pub use loss::{LossMetrics, LossOutput, PixelCrossEntropy};
pub use model::{SegmentationModel, StepOutput};
pub use optimizer::{AdamWConfig, OptimizerState, TrainerOptimizer, TrainerOptimizerOptions};
pub use sample::{LabelMap, SampleWriter};
pub use trainer::{EpochSummary, Trainer, TrainingReport};
