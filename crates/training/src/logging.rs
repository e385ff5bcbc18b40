use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    checkpoint::CheckpointDescriptor,
    config::LoggingConfig,
    metrics::{EvaluationSummary, StepSnapshot},
    optimizer::StepStats,
    TrainingError,
};

/// Installs the global `tracing` subscriber. `RUST_LOG` takes precedence
/// over the configured filter. Calling this twice is harmless.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: 32,
        }
    }
}

/// Emits the per-batch and per-epoch status lines and mirrors scalars into
/// an optional TensorBoard event file.
///
/// Nothing here can fail the run: a broken event file is reported once and
/// then ignored.
pub struct Logger {
    tensorboard: Option<TensorBoardWriter>,
    sink_failed: bool,
}

impl Logger {
    /// Opens the event file when one is configured. An event file that
    /// cannot be created is reported once and the logger carries on with
    /// stdout only.
    pub fn new(settings: LoggingSettings) -> Self {
        let mut sink_failed = false;
        let tensorboard = settings.tensorboard_dir.as_ref().and_then(|dir| {
            TensorBoardWriter::create(dir, settings.tensorboard_flush_every_n)
                .map_err(|err| Self::note_sink_failure(&mut sink_failed, &err))
                .ok()
        });
        Self {
            tensorboard,
            sink_failed,
        }
    }

    /// Whether the event file was given up on.
    pub fn sink_failed(&self) -> bool {
        self.sink_failed
    }

    /// A logger with no event file.
    pub fn stdout_only() -> Self {
        Self {
            tensorboard: None,
            sink_failed: false,
        }
    }

    pub fn log_training_batch(
        &mut self,
        epoch: usize,
        batch: usize,
        global_step: usize,
        snapshot: &StepSnapshot,
        update: Option<&StepStats>,
    ) {
        info!("[epoch {}, batch {}] training error: {}", epoch, batch, snapshot.step_loss);
        tracing::debug!(
            epoch,
            batch,
            samples = snapshot.samples,
            samples_per_sec = snapshot.samples_per_sec,
            grad_norm = update.map(|u| u.grad_norm),
            "training batch"
        );

        let step = global_step as i64;
        self.scalar("train/loss", step, snapshot.step_loss);
        self.scalar("train/loss_ema", step, snapshot.smoothed_loss);
        self.scalar("train/samples_per_sec", step, snapshot.samples_per_sec);
        if let Some(update) = update {
            self.scalar("train/grad_norm", step, update.grad_norm);
        }
    }

    pub fn log_training_finished(&mut self, epoch: usize, elapsed: Duration, mean_loss: Option<f64>) {
        info!(
            "==== epoch {} took {:.0} seconds to train. ====",
            epoch,
            elapsed.as_secs_f64()
        );
        let step = epoch as i64;
        self.scalar("epoch/train_seconds", step, elapsed.as_secs_f64());
        if let Some(loss) = mean_loss {
            self.scalar("epoch/train_loss", step, loss);
        }
    }

    pub fn log_validation(&mut self, epoch: usize, summary: &EvaluationSummary, elapsed: Duration) {
        info!("==== average validation error: {} ====", summary.average_loss);
        info!(
            "==== epoch {} took {:.0} seconds to evaluate the validation set. ====",
            epoch,
            elapsed.as_secs_f64()
        );

        let step = epoch as i64;
        self.scalar("eval/loss", step, summary.average_loss);
        self.scalar("eval/pixel_accuracy", step, summary.pixel_accuracy);
        self.scalar("epoch/eval_seconds", step, elapsed.as_secs_f64());
    }

    pub fn log_checkpoint(&mut self, descriptor: &CheckpointDescriptor) {
        info!(
            epoch = descriptor.manifest.epoch,
            path = %descriptor.directory.display(),
            "checkpoint saved"
        );
    }

    pub fn log_sample(&mut self, epoch: usize, path: &Path) {
        tracing::debug!(epoch, path = %path.display(), "sample written");
    }

    /// Reports an error the loop has decided to survive.
    pub fn log_recovered(&mut self, epoch: usize, err: &TrainingError) {
        error!(epoch, "{err}; continuing");
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                Self::note_sink_failure(&mut self.sink_failed, &err);
            }
        }
    }

    fn scalar(&mut self, tag: &str, step: i64, value: f64) {
        let Some(writer) = self.tensorboard.as_mut() else {
            return;
        };
        if let Err(err) = writer.write_scalar(tag, step, value) {
            Self::note_sink_failure(&mut self.sink_failed, &err);
        }
    }

    fn note_sink_failure(already_reported: &mut bool, err: &TrainingError) {
        if !*already_reported {
            warn!("tensorboard logging disabled after error: {err}");
            *already_reported = true;
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        self.write_event(&Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(summary),
        })
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
