use std::{path::PathBuf, sync::Arc};

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;

use crate::{
    config::{DataConfig, LastBatchPolicy, ReadErrorPolicy, TrainingConfig},
    error::to_runtime_error,
    TrainingError,
};

pub mod manifest;

pub use manifest::{read_manifest, split_identifiers, SampleId, Split};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One group of decoded examples.
#[derive(Debug)]
pub struct Batch {
    /// Position of the batch within its pass.
    pub index: usize,
    pub ids: Vec<SampleId>,
    /// `(batch, height, width, 3)` RGB values in `[0, 1]`.
    pub inputs: Tensor,
    /// `(batch, height, width, num_classes)` one-hot masks.
    pub targets: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Order in which a pass visits its identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOrder {
    Sequential,
    Shuffled(u64),
}

/// Where the image and mask of an identifier live on disk.
#[derive(Debug, Clone)]
pub struct SampleLayout {
    pub images_dir: PathBuf,
    pub masks_dir: PathBuf,
    pub image_extension: String,
    pub mask_suffix: String,
    pub mask_extension: String,
}

impl SampleLayout {
    pub fn from_config(config: &DataConfig) -> Self {
        Self {
            images_dir: config.input_dir.join(&config.images_subdir),
            masks_dir: config.input_dir.join(&config.masks_subdir),
            image_extension: config.image_extension.clone(),
            mask_suffix: config.mask_suffix.clone(),
            mask_extension: config.mask_extension.clone(),
        }
    }

    pub fn image_path(&self, id: &SampleId) -> PathBuf {
        self.images_dir
            .join(format!("{}.{}", id.as_str(), self.image_extension))
    }

    pub fn mask_path(&self, id: &SampleId) -> PathBuf {
        self.masks_dir.join(format!(
            "{}{}.{}",
            id.as_str(),
            self.mask_suffix,
            self.mask_extension
        ))
    }
}

/// Produces batches of resized images and one-hot masks.
///
/// Every call to [`BatchSource::stream`] or [`BatchSource::stream_validation`]
/// starts a fresh pass; nothing is cached between passes. Samples of one
/// batch are decoded in parallel on the rayon pool, and the batch keeps the
/// order of its identifiers.
pub struct BatchSource {
    layout: SampleLayout,
    batch_size: usize,
    input_shape: usize,
    num_classes: usize,
    last_batch: LastBatchPolicy,
    on_read_error: ReadErrorPolicy,
    device: Device,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl BatchSource {
    pub fn new(config: &TrainingConfig, device: Device) -> Result<Self> {
        let data = &config.data;
        if data.batch_size == 0 || data.input_shape == 0 {
            return Err(TrainingError::initialization(
                "batch size and input shape must be greater than zero",
            ));
        }

        let pool = match data.num_workers {
            Some(threads) => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|index| format!("decode-{index}"))
                    .build()
                    .map_err(|err| {
                        TrainingError::initialization(format!(
                            "failed to start decode workers: {err}"
                        ))
                    })?,
            )),
            None => None,
        };

        Ok(Self {
            layout: SampleLayout::from_config(data),
            batch_size: data.batch_size,
            input_shape: data.input_shape,
            num_classes: config.model.num_classes,
            last_batch: data.last_batch,
            on_read_error: data.on_read_error,
            device,
            pool,
        })
    }

    pub fn layout(&self) -> &SampleLayout {
        &self.layout
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches one training pass over `samples` identifiers yields
    /// when no sample is skipped.
    pub fn batches_per_pass(&self, samples: usize) -> usize {
        match self.last_batch {
            LastBatchPolicy::Keep => samples.div_ceil(self.batch_size),
            LastBatchPolicy::Drop => samples / self.batch_size,
        }
    }

    /// Starts a training pass over `ids` under the configured last-batch
    /// policy.
    pub fn stream(&self, ids: &[SampleId], order: PassOrder) -> ImageMaskLoader<'_> {
        self.open_pass(ids, order, self.last_batch)
    }

    /// Starts a validation pass: manifest order, and the short final batch is
    /// always kept so every identifier is scored.
    pub fn stream_validation(&self, ids: &[SampleId]) -> ImageMaskLoader<'_> {
        self.open_pass(ids, PassOrder::Sequential, LastBatchPolicy::Keep)
    }

    fn open_pass(
        &self,
        ids: &[SampleId],
        order: PassOrder,
        last_batch: LastBatchPolicy,
    ) -> ImageMaskLoader<'_> {
        let mut queue = ids.to_vec();
        if let PassOrder::Shuffled(seed) = order {
            let mut rng = StdRng::seed_from_u64(seed);
            queue.shuffle(&mut rng);
        }
        ImageMaskLoader {
            source: self,
            queue,
            last_batch,
            cursor: 0,
            next_index: 0,
            finished: false,
        }
    }

    fn load_batch(&self, ids: &[SampleId]) -> Result<Option<(Vec<SampleId>, Tensor, Tensor)>> {
        let decode = || -> Vec<Result<DecodedSample>> {
            ids.par_iter().map(|id| self.load_sample(id)).collect()
        };
        let decoded = match &self.pool {
            Some(pool) => pool.install(decode),
            None => decode(),
        };

        let side = self.input_shape;
        let mut kept = Vec::with_capacity(ids.len());
        let mut inputs = Vec::with_capacity(ids.len() * side * side * 3);
        let mut targets = Vec::with_capacity(ids.len() * side * side * self.num_classes);
        for (id, sample) in ids.iter().zip(decoded) {
            match sample {
                Ok(sample) => {
                    inputs.extend(sample.pixels);
                    one_hot_into(&sample.labels, self.num_classes, &mut targets);
                    kept.push(id.clone());
                }
                Err(err) if self.on_read_error == ReadErrorPolicy::Skip => {
                    tracing::warn!(sample = %id, error = %err, "skipping unreadable sample");
                }
                Err(err) => return Err(err),
            }
        }

        if kept.is_empty() {
            return Ok(None);
        }

        let count = kept.len();
        let inputs = Tensor::from_vec(inputs, (count, side, side, 3), &self.device)
            .map_err(to_runtime_error)?;
        let targets = Tensor::from_vec(targets, (count, side, side, self.num_classes), &self.device)
            .map_err(to_runtime_error)?;
        Ok(Some((kept, inputs, targets)))
    }

    fn load_sample(&self, id: &SampleId) -> Result<DecodedSample> {
        let size = self.input_shape as u32;

        let image_path = self.layout.image_path(id);
        let image = image::open(&image_path)
            .map_err(|err| TrainingError::sample_read(id.as_str(), &image_path, err.to_string()))?;
        let pixels = image
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8()
            .into_raw()
            .into_iter()
            .map(|value| f32::from(value) / 255.0)
            .collect();

        let mask_path = self.layout.mask_path(id);
        let mask = image::open(&mask_path)
            .map_err(|err| TrainingError::sample_read(id.as_str(), &mask_path, err.to_string()))?;
        let labels = mask
            .resize_exact(size, size, FilterType::Nearest)
            .to_luma8()
            .into_raw()
            .into_iter()
            .map(|value| mask_class(value, self.num_classes))
            .collect();

        Ok(DecodedSample { pixels, labels })
    }
}

struct DecodedSample {
    pixels: Vec<f32>,
    labels: Vec<usize>,
}

/// Binary masks are thresholded at mid-gray; masks for more classes store
/// the class index directly in the luma channel.
fn mask_class(value: u8, num_classes: usize) -> usize {
    if num_classes == 2 {
        usize::from(value >= 128)
    } else {
        usize::from(value).min(num_classes - 1)
    }
}

fn one_hot_into(labels: &[usize], num_classes: usize, out: &mut Vec<f32>) {
    for &label in labels {
        out.extend((0..num_classes).map(|class| if class == label { 1.0 } else { 0.0 }));
    }
}

/// Lazy iterator over one pass of a [`BatchSource`].
///
/// Under the `abort` read policy the first failing sample ends the pass:
/// the error is yielded once and iteration stops.
pub struct ImageMaskLoader<'a> {
    source: &'a BatchSource,
    queue: Vec<SampleId>,
    last_batch: LastBatchPolicy,
    cursor: usize,
    next_index: usize,
    finished: bool,
}

impl ImageMaskLoader<'_> {
    /// Identifiers in the order this pass visits them.
    pub fn order(&self) -> &[SampleId] {
        &self.queue
    }
}

impl Iterator for ImageMaskLoader<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished && self.cursor < self.queue.len() {
            let end = (self.cursor + self.source.batch_size).min(self.queue.len());
            let chunk = &self.queue[self.cursor..end];
            self.cursor = end;

            if chunk.len() < self.source.batch_size && self.last_batch == LastBatchPolicy::Drop {
                self.finished = true;
                return None;
            }

            match self.source.load_batch(chunk) {
                Ok(Some((ids, inputs, targets))) => {
                    let index = self.next_index;
                    self.next_index += 1;
                    return Some(Ok(Batch {
                        index,
                        ids,
                        inputs,
                        targets,
                    }));
                }
                Ok(None) => continue,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_values_map_to_classes() {
        assert_eq!(mask_class(0, 2), 0);
        assert_eq!(mask_class(127, 2), 0);
        assert_eq!(mask_class(128, 2), 1);
        assert_eq!(mask_class(255, 2), 1);
        assert_eq!(mask_class(2, 4), 2);
        assert_eq!(mask_class(200, 4), 3);
    }

    #[test]
    fn one_hot_encodes_each_pixel() {
        let mut out = Vec::new();
        one_hot_into(&[1, 0, 2], 3, &mut out);
        assert_eq!(out, vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn layout_follows_naming_convention() {
        let layout = SampleLayout {
            images_dir: PathBuf::from("input/train"),
            masks_dir: PathBuf::from("input/train_masks"),
            image_extension: "jpg".into(),
            mask_suffix: "_mask".into(),
            mask_extension: "gif".into(),
        };
        let id = SampleId::new("0cdf5b5d0ce1_01");
        assert_eq!(
            layout.image_path(&id),
            PathBuf::from("input/train/0cdf5b5d0ce1_01.jpg")
        );
        assert_eq!(
            layout.mask_path(&id),
            PathBuf::from("input/train_masks/0cdf5b5d0ce1_01_mask.gif")
        );
    }
}
