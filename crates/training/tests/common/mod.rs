#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
};

use image::{GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use training::TrainingConfig;

pub const SIDE: u32 = 16;

/// A tiny image/mask dataset plus a config file pointing at it.
pub struct Fixture {
    pub root: tempfile::TempDir,
    pub ids: Vec<String>,
}

impl Fixture {
    /// `count` samples named `car_000`..; each image is a bright square on a
    /// dark background and its mask marks the square.
    pub fn new(count: usize) -> anyhow::Result<Self> {
        let root = tempfile::tempdir()?;
        let input = root.path().join("input");
        fs::create_dir_all(input.join("train"))?;
        fs::create_dir_all(input.join("train_masks"))?;

        let mut manifest = String::from("img,rle_mask\n");
        let mut ids = Vec::with_capacity(count);
        for index in 0..count {
            let id = format!("car_{index:03}");
            let offset = (index as u32 % 4) * 2;
            let inside = |x: u32, y: u32| {
                (offset + 2..offset + 10).contains(&x) && (offset + 2..offset + 10).contains(&y)
            };

            let image = RgbImage::from_fn(SIDE, SIDE, |x, y| {
                if inside(x, y) {
                    Rgb([220, 200, 40])
                } else {
                    Rgb([20, 30, 60])
                }
            });
            image.save_with_format(input.join("train").join(format!("{id}.png")), ImageFormat::Png)?;

            let mask = GrayImage::from_fn(SIDE, SIDE, |x, y| {
                if inside(x, y) {
                    Luma([255])
                } else {
                    Luma([0])
                }
            });
            mask.save_with_format(
                input.join("train_masks").join(format!("{id}_mask.png")),
                ImageFormat::Png,
            )?;

            manifest.push_str(&format!("{id}.jpg,1 1\n"));
            ids.push(id);
        }
        fs::write(input.join("train_masks.csv"), manifest)?;

        Ok(Self { root, ids })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn samples_dir(&self) -> PathBuf {
        self.path().join("sample_results").join("val")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.path().join("checkpoints")
    }

    pub fn mask_path(&self, id: &str) -> PathBuf {
        self.path()
            .join("input")
            .join("train_masks")
            .join(format!("{id}_mask.png"))
    }

    /// Writes `train.toml` with small-model settings plus `extra` TOML lines
    /// appended to the given sections, then loads it.
    pub fn config(&self, max_epochs: usize, extra_data: &str, extra_checkpoint: &str) -> anyhow::Result<TrainingConfig> {
        let contents = format!(
            r#"
[model]
base_channels = 4
depth = 2
dropout = 0.0

[data]
input_dir = "input"
image_extension = "png"
mask_extension = "png"
input_shape = {SIDE}
batch_size = 16
num_workers = 2
{extra_data}

[optimizer]
learning_rate = 1e-3

[runtime]
max_epochs = {max_epochs}
device = "cpu"

[runtime.checkpoint]
directory = "checkpoints"
{extra_checkpoint}

[runtime.samples]
directory = "sample_results/val"
"#
        );
        let path = self.path().join("train.toml");
        fs::write(&path, contents)?;
        Ok(TrainingConfig::load(&path)?)
    }
}

/// Snapshot directories in a run directory, sorted by name.
pub fn snapshot_names(run_dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(run_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
