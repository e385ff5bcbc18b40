use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use unet::UNetConfig;

use crate::error::TrainingError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let mut config = Self::parse_path(path.as_ref())?;
        let base_dir = path.as_ref().parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    /// Reads the file as a loosely typed JSON value so callers can patch
    /// individual keys before deserializing.
    pub fn load_value(path: impl AsRef<Path>) -> Result<serde_json::Value, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match config_format(path)? {
            ConfigFormat::Json => Ok(serde_json::from_str(&contents)?),
            ConfigFormat::Toml => {
                let value: toml::Value = toml::from_str(&contents)?;
                Ok(serde_json::to_value(value)?)
            }
        }
    }

    /// Finishes loading a value produced by [`TrainingConfig::load_value`].
    pub fn from_value(
        value: serde_json::Value,
        config_path: impl AsRef<Path>,
    ) -> Result<Self, TrainingError> {
        let mut config: TrainingConfig = serde_json::from_value(value)?;
        let base_dir = config_path
            .as_ref()
            .parent()
            .unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;
        Ok(config)
    }

    fn parse_path(path: &Path) -> Result<Self, TrainingError> {
        let contents = fs::read_to_string(path)?;
        match config_format(path)? {
            ConfigFormat::Json => Ok(serde_json::from_str(&contents)?),
            ConfigFormat::Toml => Ok(toml::from_str(&contents)?),
        }
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.num_classes < 2 {
            errors.push("model.num_classes must be at least 2".to_string());
        }
        if self.model.input_channels == 0 {
            errors.push("model.input_channels must be greater than 0".to_string());
        }
        if self.model.base_channels == 0 {
            errors.push("model.base_channels must be greater than 0".to_string());
        }
        if !(1..=8).contains(&self.model.depth) {
            errors.push("model.depth must be between 1 and 8".to_string());
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            errors.push(format!(
                "model.dropout must be in [0, 1) (got {})",
                self.model.dropout
            ));
        }

        if self.data.input_dir.as_os_str().is_empty() {
            errors.push("data.input_dir must not be empty".to_string());
        }
        if self.data.image_column.trim().is_empty() {
            errors.push("data.image_column must not be empty".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.input_shape == 0 {
            errors.push("data.input_shape must be greater than 0".to_string());
        } else if self.model.depth <= 8 && self.data.input_shape % (1 << self.model.depth) != 0 {
            errors.push(format!(
                "data.input_shape {} must be divisible by 2^model.depth ({})",
                self.data.input_shape,
                1usize << self.model.depth
            ));
        }
        if !(self.data.validation_fraction > 0.0 && self.data.validation_fraction < 1.0) {
            errors.push("data.validation_fraction must be in (0, 1)".to_string());
        }
        if let Some(0) = self.data.num_workers {
            errors.push("data.num_workers must be greater than 0".to_string());
        }
        if self.model.input_channels != 3 {
            errors.push("model.input_channels must be 3 (images are decoded as RGB)".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }
        if let Some(norm) = self.optimizer.max_grad_norm {
            if norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if self.runtime.max_epochs == 0 {
            errors.push("runtime.max_epochs must be greater than 0".to_string());
        }
        let checkpoint = &self.runtime.checkpoint;
        if checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }
        if checkpoint.every_n_epochs == 0 {
            errors.push("runtime.checkpoint.every_n_epochs must be greater than 0".to_string());
        }
        if checkpoint.max_keep == 0 {
            errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
        }
        if checkpoint.model_name.trim().is_empty() || checkpoint.model_name.contains('/') {
            errors.push(
                "runtime.checkpoint.model_name must be a non-empty name without '/'".to_string(),
            );
        }
        if self.runtime.samples.enabled && self.runtime.samples.directory.as_os_str().is_empty() {
            errors.push("runtime.samples.directory must not be empty".to_string());
        }
        if self.runtime.logging.filter.trim().is_empty() {
            errors.push("runtime.logging.filter must not be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }

    /// Network hyperparameters for the given device.
    pub fn unet_config(&self, device: &Device) -> UNetConfig {
        UNetConfig {
            input_channels: self.model.input_channels,
            num_classes: self.model.num_classes,
            base_channels: self.model.base_channels,
            depth: self.model.depth,
            dropout_p: (self.model.dropout > 0.0).then_some(self.model.dropout),
            dtype: DType::F32,
            device: device.clone(),
        }
    }
}

enum ConfigFormat {
    Toml,
    Json,
}

fn config_format(path: &Path) -> Result<ConfigFormat, TrainingError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(ConfigFormat::Json),
        Some("toml") | Some("tml") | None => Ok(ConfigFormat::Toml),
        Some(other) => Err(TrainingError::ConfigFormat(format!(
            "unsupported configuration extension '{}'",
            other
        ))),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default = "default_input_channels")]
    pub input_channels: usize,
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            input_channels: default_input_channels(),
            base_channels: default_base_channels(),
            depth: default_depth(),
            dropout: default_dropout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataConfig {
    pub input_dir: PathBuf,
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    #[serde(default = "default_image_column")]
    pub image_column: String,
    #[serde(default = "default_images_subdir")]
    pub images_subdir: String,
    #[serde(default = "default_masks_subdir")]
    pub masks_subdir: String,
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
    #[serde(default = "default_mask_suffix")]
    pub mask_suffix: String,
    #[serde(default = "default_mask_extension")]
    pub mask_extension: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_input_shape")]
    pub input_shape: usize,
    #[serde(default = "default_validation_fraction")]
    pub validation_fraction: f64,
    #[serde(default = "default_true")]
    pub shuffle_training: bool,
    #[serde(default)]
    pub last_batch: LastBatchPolicy,
    #[serde(default)]
    pub on_read_error: ReadErrorPolicy,
    #[serde(default)]
    pub num_workers: Option<usize>,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.input_dir, base);
        if self.manifest.is_relative() {
            self.manifest = self.input_dir.join(&self.manifest);
        }
    }
}

/// What to do with a final batch shorter than `batch_size`.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LastBatchPolicy {
    #[default]
    Keep,
    Drop,
}

/// What to do when an image or mask cannot be read.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadErrorPolicy {
    #[default]
    Abort,
    Skip,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            weight_decay: 0.0,
            max_grad_norm: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default)]
    pub device: DeviceChoice,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub samples: SampleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            max_epochs: default_max_epochs(),
            device: DeviceChoice::default(),
            checkpoint: CheckpointConfig::default(),
            samples: SampleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint.directory, base);
        absolutize_in_place(&mut self.samples.directory, base);
        if let Some(path) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceChoice {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl DeviceChoice {
    /// Resolves the choice to a concrete device. `Auto` prefers CUDA, then
    /// Metal, and falls back to the CPU.
    pub fn resolve(self) -> Result<Device, TrainingError> {
        let init = |err: candle_core::Error| {
            TrainingError::initialization(format!("failed to open device: {err}"))
        };
        match self {
            DeviceChoice::Cpu => Ok(Device::Cpu),
            DeviceChoice::Cuda => Device::new_cuda(0).map_err(init),
            DeviceChoice::Metal => Device::new_metal(0).map_err(init),
            DeviceChoice::Auto => {
                if candle_core::utils::cuda_is_available() {
                    Device::new_cuda(0).map_err(init)
                } else if candle_core::utils::metal_is_available() {
                    Device::new_metal(0).map_err(init)
                } else {
                    Ok(Device::Cpu)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_every_n_epochs")]
    pub every_n_epochs: usize,
    #[serde(default = "default_max_keep")]
    pub max_keep: usize,
    #[serde(default = "default_model_name")]
    pub model_name: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_directory(),
            every_n_epochs: default_every_n_epochs(),
            max_keep: default_max_keep(),
            model_name: default_model_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SampleConfig {
    #[serde(default = "default_samples_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            directory: default_samples_directory(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
            tensorboard: None,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_num_classes() -> usize {
    2
}

fn default_input_channels() -> usize {
    3
}

fn default_base_channels() -> usize {
    64
}

fn default_depth() -> usize {
    4
}

fn default_dropout() -> f32 {
    0.5
}

fn default_manifest() -> PathBuf {
    PathBuf::from("train_masks.csv")
}

fn default_image_column() -> String {
    "img".to_string()
}

fn default_images_subdir() -> String {
    "train".to_string()
}

fn default_masks_subdir() -> String {
    "train_masks".to_string()
}

fn default_image_extension() -> String {
    "jpg".to_string()
}

fn default_mask_suffix() -> String {
    "_mask".to_string()
}

fn default_mask_extension() -> String {
    "gif".to_string()
}

fn default_batch_size() -> usize {
    16
}

fn default_input_shape() -> usize {
    512
}

fn default_validation_fraction() -> f64 {
    0.2
}

fn default_true() -> bool {
    true
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_seed() -> u64 {
    233
}

fn default_max_epochs() -> usize {
    50
}

fn default_checkpoint_directory() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_every_n_epochs() -> usize {
    10
}

fn default_max_keep() -> usize {
    5
}

fn default_model_name() -> String {
    "unet".to_string()
}

fn default_samples_directory() -> PathBuf {
    PathBuf::from("sample_results/val")
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal() -> TrainingConfig {
        toml::from_str("[data]\ninput_dir = \"input\"\n").expect("minimal config parses")
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = minimal();
        assert_eq!(config.model.num_classes, 2);
        assert_eq!(config.data.batch_size, 16);
        assert_eq!(config.data.input_shape, 512);
        assert_eq!(config.data.validation_fraction, 0.2);
        assert_eq!(config.data.last_batch, LastBatchPolicy::Keep);
        assert_eq!(config.data.on_read_error, ReadErrorPolicy::Abort);
        assert_eq!(config.optimizer.learning_rate, 1e-4);
        assert_eq!(config.runtime.seed, 233);
        assert_eq!(config.runtime.max_epochs, 50);
        assert_eq!(config.runtime.checkpoint.every_n_epochs, 10);
        assert_eq!(config.runtime.checkpoint.max_keep, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = minimal();
        config.data.batch_size = 0;
        config.runtime.max_epochs = 0;
        config.runtime.checkpoint.max_keep = 0;

        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn input_shape_must_survive_every_downsampling() {
        let mut config = minimal();
        config.model.depth = 4;
        config.data.input_shape = 40;
        assert!(config.validate().is_err());
        config.data.input_shape = 48;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn relative_paths_resolve_against_config_directory() {
        let mut config = minimal();
        config.apply_base_path(Path::new("/runs/exp"));
        assert_eq!(config.data.input_dir, PathBuf::from("/runs/exp/input"));
        assert_eq!(
            config.data.manifest,
            PathBuf::from("/runs/exp/input/train_masks.csv")
        );
        assert_eq!(
            config.runtime.checkpoint.directory,
            PathBuf::from("/runs/exp/checkpoints")
        );
        assert_eq!(
            config.runtime.samples.directory,
            PathBuf::from("/runs/exp/sample_results/val")
        );
    }

    #[test]
    fn zero_dropout_disables_the_layer() {
        let mut config = minimal();
        config.model.dropout = 0.0;
        assert_eq!(config.unet_config(&Device::Cpu).dropout_p, None);
    }

    #[test]
    fn rejects_unknown_extension() {
        assert!(matches!(
            config_format(Path::new("train.yaml")),
            Err(TrainingError::ConfigFormat(_))
        ));
    }
}
