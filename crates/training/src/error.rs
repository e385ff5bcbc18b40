use std::path::PathBuf;

use thiserror::Error;

/// Every failure the training pipeline can surface.
///
/// Checkpoint and sample-image failures are recoverable: the loop logs them
/// and moves on to the next epoch. Everything else terminates the run.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("trainer initialization failed: {0}")]
    Initialization(String),

    #[error("training failed: {0}")]
    Runtime(String),

    #[error("manifest {}: {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },

    #[error("failed to read sample '{id}' from {}: {reason}", path.display())]
    SampleRead {
        id: String,
        path: PathBuf,
        reason: String,
    },

    #[error("validation pass of epoch {epoch} produced no batch losses")]
    EmptyValidationSet { epoch: usize },

    #[error("checkpoint {}: {reason}", path.display())]
    CheckpointIo { path: PathBuf, reason: String },

    #[error("failed to write sample image {}: {reason}", path.display())]
    ImageWrite { path: PathBuf, reason: String },
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn manifest(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn sample_read(
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self::SampleRead {
            id: id.into(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn checkpoint_io(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointIo {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn image_write(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ImageWrite {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the training loop may log this error and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::CheckpointIo { .. } | Self::ImageWrite { .. })
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
