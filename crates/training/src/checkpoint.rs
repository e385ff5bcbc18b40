use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unet::UNet;

use crate::{model::SegmentationModel, optimizer::OptimizerState, TrainingConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model_name: String,
    pub input_shape: usize,
    pub epoch: usize,
    pub validation_loss: Option<f64>,
    pub model: FileRecord,
    pub optimizer: FileRecord,
}

/// Naming and retention rules for the snapshots of one run.
#[derive(Debug, Clone)]
pub struct CheckpointSettings {
    pub model_name: String,
    pub input_shape: usize,
    pub every_n_epochs: usize,
    pub max_keep: usize,
    pub config_sha256: String,
}

impl CheckpointSettings {
    pub fn from_config(config: &TrainingConfig) -> Result<Self, TrainingError> {
        let checkpoint = &config.runtime.checkpoint;
        Ok(Self {
            model_name: checkpoint.model_name.clone(),
            input_shape: config.data.input_shape,
            every_n_epochs: checkpoint.every_n_epochs,
            max_keep: checkpoint.max_keep,
            config_sha256: fingerprint_config(config)?,
        })
    }
}

pub struct SaveRequest<'a> {
    pub model: &'a SegmentationModel,
    pub validation_loss: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub model_weights_path: PathBuf,
}

/// Writes epoch snapshots into a per-run directory.
///
/// A snapshot is assembled in a hidden staging directory and published with
/// a single `rename`, so readers never see a half-written snapshot.
#[derive(Debug)]
pub struct CheckpointManager {
    run_dir: PathBuf,
    settings: CheckpointSettings,
    last_epoch: usize,
}

impl CheckpointManager {
    /// Creates `<base_dir>/<unix seconds>`, appending `-1`, `-2`, ... when a
    /// run started within the same second.
    pub fn create(
        base_dir: &Path,
        settings: CheckpointSettings,
        last_epoch: usize,
    ) -> Result<Self, TrainingError> {
        fs::create_dir_all(base_dir).map_err(|err| io_error(base_dir, err))?;

        let stamp = unix_timestamp();
        let mut attempt = 0usize;
        let run_dir = loop {
            let name = if attempt == 0 {
                stamp.to_string()
            } else {
                format!("{stamp}-{attempt}")
            };
            let candidate = base_dir.join(name);
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => return Err(io_error(&candidate, err)),
            }
        };

        Ok(Self {
            run_dir,
            settings,
            last_epoch,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn settings(&self) -> &CheckpointSettings {
        &self.settings
    }

    /// Every `every_n_epochs`-th epoch except epoch 0, plus the last epoch.
    pub fn should_save(&self, epoch: usize) -> bool {
        let cadence = self.settings.every_n_epochs.max(1);
        (epoch > 0 && epoch % cadence == 0) || epoch == self.last_epoch
    }

    pub fn snapshot_name(&self, epoch: usize) -> String {
        format!(
            "{}-{}-{}",
            self.settings.model_name, self.settings.input_shape, epoch
        )
    }

    pub fn maybe_save(
        &self,
        request: SaveRequest<'_>,
        epoch: usize,
    ) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        if !self.should_save(epoch) {
            return Ok(None);
        }
        self.save(request, epoch).map(Some)
    }

    pub fn save(
        &self,
        request: SaveRequest<'_>,
        epoch: usize,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        let name = self.snapshot_name(epoch);
        let target = self.run_dir.join(&name);
        let staging = self.run_dir.join(format!("{STAGING_PREFIX}{name}"));

        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|err| io_error(&staging, err))?;
        }
        fs::create_dir(&staging).map_err(|err| io_error(&staging, err))?;

        let manifest = match self.write_snapshot(&staging, request, epoch) {
            Ok(manifest) => manifest,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(err);
            }
        };

        if target.exists() {
            fs::remove_dir_all(&target).map_err(|err| io_error(&target, err))?;
        }
        fs::rename(&staging, &target).map_err(|err| io_error(&target, err))?;

        // The snapshot is already published; a failed prune only leaves extras.
        if let Err(err) = prune_checkpoints(&self.run_dir, &self.settings, self.settings.max_keep) {
            tracing::warn!(path = %target.display(), "failed to prune old checkpoints: {err}");
        }

        Ok(CheckpointDescriptor {
            directory: target,
            manifest,
        })
    }

    fn write_snapshot(
        &self,
        directory: &Path,
        request: SaveRequest<'_>,
        epoch: usize,
    ) -> Result<CheckpointManifest, TrainingError> {
        let model_path = directory.join(MODEL_FILENAME);
        save_model_weights(request.model.network(), &model_path)?;
        let model_record = file_record(&model_path)?;

        let optimizer_path = directory.join(OPTIMIZER_FILENAME);
        write_json(&optimizer_path, &request.model.optimizer_state()?)?;
        let optimizer_record = file_record(&optimizer_path)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            config_sha256: self.settings.config_sha256.clone(),
            model_name: self.settings.model_name.clone(),
            input_shape: self.settings.input_shape,
            epoch,
            validation_loss: request.validation_loss,
            model: model_record,
            optimizer: optimizer_record,
        };
        write_json(&directory.join(MANIFEST_FILENAME), &manifest)?;
        Ok(manifest)
    }
}

/// Newest snapshot under `run_dir`, judged by the epoch in each manifest.
pub fn latest_checkpoint(run_dir: &Path) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    let mut newest: Option<CheckpointDescriptor> = None;
    for entry in fs::read_dir(run_dir).map_err(|err| io_error(run_dir, err))? {
        let entry = entry.map_err(|err| io_error(run_dir, err))?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || !path.join(MANIFEST_FILENAME).is_file() {
            continue;
        }
        let manifest = load_manifest(&path)?;
        if newest
            .as_ref()
            .map_or(true, |current| manifest.epoch > current.manifest.epoch)
        {
            newest = Some(CheckpointDescriptor {
                directory: path,
                manifest,
            });
        }
    }
    Ok(newest)
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(directory, manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;

    let optimizer_path = directory.join(&manifest.optimizer.filename);
    validate_file(&optimizer_path, &manifest.optimizer.sha256)?;
    let optimizer_state: OptimizerState = read_json(&optimizer_path)?;

    Ok(LoadOutcome {
        manifest,
        optimizer_state,
        model_weights_path: model_path,
    })
}

/// Copies every saved tensor, running statistics included, into `network`.
pub fn apply_model_weights(network: &UNet, weights_path: &Path) -> Result<(), TrainingError> {
    let device = network.config().device.clone();
    let fail = |reason: String| TrainingError::checkpoint_io(weights_path, reason);
    let tensors = load_safetensors(weights_path, &device).map_err(|err| fail(err.to_string()))?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in network.parameters() {
        let tensor = params_by_name
            .remove(&name)
            .ok_or_else(|| fail(format!("checkpoint missing parameter {name}")))?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(fail(format!(
                "parameter {name} has shape {:?}, model expects {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let tensor = tensor
            .to_dtype(var.as_tensor().dtype())
            .map_err(|err| fail(err.to_string()))?;
        var.set(&tensor).map_err(|err| fail(err.to_string()))?;
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.into_keys().collect::<Vec<_>>();
        extra.sort();
        return Err(fail(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

fn save_model_weights(network: &UNet, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = network.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::checkpoint_io(
            path,
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, candle_core::Tensor> = named_parameters
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path)
        .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to serialize weights: {err}")))
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path.metadata().map_err(|err| io_error(path, err))?.len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TrainingError::checkpoint_io(path, "file name is not valid UTF-8"))?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

/// `<model_name>-<input_shape>-<epoch>` directories, sorted by epoch.
fn snapshot_directories(
    run_dir: &Path,
    settings: &CheckpointSettings,
) -> Result<Vec<(usize, PathBuf)>, TrainingError> {
    let prefix = format!("{}-{}-", settings.model_name, settings.input_shape);
    let mut dirs = Vec::new();
    if !run_dir.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(run_dir).map_err(|err| io_error(run_dir, err))? {
        let entry = entry.map_err(|err| io_error(run_dir, err))?;
        let file_type = entry.file_type().map_err(|err| io_error(&entry.path(), err))?;
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let epoch = name
            .to_str()
            .and_then(|name| name.strip_prefix(&prefix))
            .and_then(|suffix| suffix.parse::<usize>().ok());
        if let Some(epoch) = epoch {
            dirs.push((epoch, entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn prune_checkpoints(
    run_dir: &Path,
    settings: &CheckpointSettings,
    max_keep: usize,
) -> Result<(), TrainingError> {
    if max_keep == 0 {
        return Ok(());
    }
    let dirs = snapshot_directories(run_dir, settings)?;
    let excess = dirs.len().saturating_sub(max_keep);
    for (_, victim) in dirs.into_iter().take(excess) {
        fs::remove_dir_all(&victim).map_err(|err| io_error(&victim, err))?;
        tracing::debug!(path = %victim.display(), "pruned checkpoint");
    }
    Ok(())
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::checkpoint_io(
            &manifest_path,
            "checkpoint manifest not found",
        ));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(directory: &Path, version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint_io(
            directory,
            format!("unsupported checkpoint version {version} (expected {CHECKPOINT_VERSION})"),
        ));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::checkpoint_io(path, "failed checksum validation"));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| io_error(path, err))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| io_error(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to serialize JSON: {err}")))?;
    let mut file = File::create(path).map_err(|err| io_error(path, err))?;
    file.write_all(&data).map_err(|err| io_error(path, err))?;
    file.write_all(b"\n").map_err(|err| io_error(path, err))?;
    file.sync_all().map_err(|err| io_error(path, err))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| io_error(path, err))?;
    serde_json::from_reader(file)
        .map_err(|err| TrainingError::checkpoint_io(path, format!("failed to parse JSON: {err}")))
}

fn io_error(path: &Path, err: io::Error) -> TrainingError {
    TrainingError::checkpoint_io(path, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings(every_n_epochs: usize, max_keep: usize) -> CheckpointSettings {
        CheckpointSettings {
            model_name: "unet".to_string(),
            input_shape: 512,
            every_n_epochs,
            max_keep,
            config_sha256: String::new(),
        }
    }

    #[test]
    fn cadence_saves_every_tenth_epoch_and_the_last() -> anyhow::Result<()> {
        let base = tempfile::tempdir()?;
        let manager = CheckpointManager::create(base.path(), settings(10, 5), 49)?;
        let saved: Vec<usize> = (0..50).filter(|&epoch| manager.should_save(epoch)).collect();
        assert_eq!(saved, vec![10, 20, 30, 40, 49]);
        assert!(!manager.should_save(0));
        Ok(())
    }

    #[test]
    fn single_epoch_run_saves_its_only_epoch() -> anyhow::Result<()> {
        let base = tempfile::tempdir()?;
        let manager = CheckpointManager::create(base.path(), settings(10, 5), 0)?;
        assert!(manager.should_save(0));
        Ok(())
    }

    #[test]
    fn runs_in_the_same_second_get_distinct_directories() -> anyhow::Result<()> {
        let base = tempfile::tempdir()?;
        let first = CheckpointManager::create(base.path(), settings(10, 5), 49)?;
        let second = CheckpointManager::create(base.path(), settings(10, 5), 49)?;
        assert_ne!(first.run_dir(), second.run_dir());
        assert!(first.run_dir().is_dir());
        assert!(second.run_dir().is_dir());
        Ok(())
    }

    #[test]
    fn pruning_keeps_newest_epochs_numerically() -> anyhow::Result<()> {
        let run = tempfile::tempdir()?;
        let settings = settings(1, 5);
        for epoch in [2, 9, 10, 20, 30, 40, 49] {
            fs::create_dir(run.path().join(format!("unet-512-{epoch}")))?;
        }
        fs::create_dir(run.path().join(".staging-unet-512-50"))?;
        fs::create_dir(run.path().join("notes"))?;

        prune_checkpoints(run.path(), &settings, 5)?;

        let remaining: Vec<usize> = snapshot_directories(run.path(), &settings)?
            .into_iter()
            .map(|(epoch, _)| epoch)
            .collect();
        assert_eq!(remaining, vec![10, 20, 30, 40, 49]);
        assert!(run.path().join("notes").is_dir());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn failed_prune_still_reports_the_published_snapshot() -> anyhow::Result<()> {
        use candle_core::Device;
        use std::os::unix::fs::PermissionsExt;

        let base = tempfile::tempdir()?;
        let config: TrainingConfig = toml::from_str(
            "[model]\nbase_channels = 2\ndepth = 1\n[data]\ninput_dir = \"input\"\n",
        )?;
        let model = SegmentationModel::new(&config, &Device::Cpu)?;
        let manager = CheckpointManager::create(base.path(), settings(1, 1), 9)?;

        // An older snapshot holding a file in a read-only directory cannot be
        // removed by an unprivileged user.
        let stale = manager.run_dir().join("unet-512-1");
        fs::create_dir(&stale)?;
        fs::write(stale.join("model.safetensors"), b"")?;
        fs::set_permissions(&stale, fs::Permissions::from_mode(0o555))?;
        let privileged = File::create(stale.join("write_check")).is_ok();

        let saved = manager.save(
            SaveRequest {
                model: &model,
                validation_loss: Some(0.5),
            },
            2,
        );
        fs::set_permissions(&stale, fs::Permissions::from_mode(0o755))?;

        let descriptor = saved?;
        assert_eq!(descriptor.directory, manager.run_dir().join("unet-512-2"));
        assert!(descriptor.directory.join(MANIFEST_FILENAME).is_file());
        if !privileged {
            assert!(stale.is_dir());
        }
        Ok(())
    }

    #[test]
    fn snapshot_names_follow_model_shape_epoch() -> anyhow::Result<()> {
        let base = tempfile::tempdir()?;
        let manager = CheckpointManager::create(base.path(), settings(10, 5), 49)?;
        assert_eq!(manager.snapshot_name(20), "unet-512-20");
        Ok(())
    }
}
