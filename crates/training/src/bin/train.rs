use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use serde_json::{Number, Value};
use training::{logging, Trainer, TrainingConfig, TrainingError};

fn main() {
    if let Err(err) = run() {
        tracing::error!("{err}");
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "U-Net segmentation training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (TOML or JSON)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Resume from a checkpoint snapshot, or the newest snapshot in a run directory"
    )]
    resume: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut value = TrainingConfig::load_value(&args.config)?;
    for override_arg in &args.overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }
    let config = TrainingConfig::from_value(value, &args.config)?;

    logging::init_tracing(&config.runtime.logging);

    let mut trainer = Trainer::new(config)?;
    if let Some(path) = args.resume.as_deref() {
        let descriptor = trainer.resume_from_path(path)?;
        tracing::info!(
            "continuing after epoch {} from {}",
            descriptor.manifest.epoch,
            descriptor.directory.display()
        );
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let report = trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;

    let saved = report
        .epochs
        .iter()
        .filter(|epoch| epoch.checkpoint.is_some())
        .count();
    match report.last_validation_loss() {
        Some(loss) => tracing::info!(
            epochs = report.epochs.len(),
            checkpoints = saved,
            run_dir = %report.run_dir.display(),
            interrupted = report.interrupted,
            "finished with validation loss {loss}"
        ),
        None => tracing::info!(
            run_dir = %report.run_dir.display(),
            interrupted = report.interrupted,
            "finished without completing an epoch"
        ),
    }

    Ok(())
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Assigns `new_value` at a dot-separated object path, creating missing
/// intermediate tables.
fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::validation(vec![format!(
            "override path '{path}' has an empty segment"
        )]));
    }

    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| TrainingError::validation(vec!["override path must not be empty".into()]))?;

    let mut current = target;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Value::Object(map) = current else {
            return Err(TrainingError::validation(vec![format!(
                "override path '{path}': '{segment}' is inside a non-table value"
            )]));
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }

    if current.is_null() {
        *current = Value::Object(serde_json::Map::new());
    }
    let Value::Object(map) = current else {
        return Err(TrainingError::validation(vec![format!(
            "override path '{path}' points into a non-table value"
        )]));
    };
    map.insert(last.to_string(), new_value);
    Ok(())
}
