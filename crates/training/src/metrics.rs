use std::time::{Duration, Instant};

use crate::TrainingError;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Arithmetic mean of per-batch losses.
///
/// An empty list means the validation pass produced nothing to score.
pub fn mean_loss(losses: &[f64], epoch: usize) -> Result<f64, TrainingError> {
    if losses.is_empty() {
        return Err(TrainingError::EmptyValidationSet { epoch });
    }
    Ok(losses.iter().sum::<f64>() / losses.len() as f64)
}

/// Running statistics for the training half of an epoch.
#[derive(Debug)]
pub struct TrainingMetrics {
    start_time: Instant,
    step_timer: Instant,
    samples_processed: u64,
    loss_sum: f64,
    batches: usize,
    loss_ema: ExponentialMovingAverage,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            step_timer: now,
            samples_processed: 0,
            loss_sum: 0.0,
            batches: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_batch(&mut self, samples: usize, loss: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.samples_processed = self.samples_processed.saturating_add(samples as u64);
        self.loss_sum += loss;
        self.batches += 1;
        let samples_per_sec = if step_duration > Duration::ZERO {
            samples as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            step_loss: loss,
            smoothed_loss: self.loss_ema.update(loss),
            samples,
            samples_per_sec,
            step_duration,
        }
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn mean_loss(&self) -> Option<f64> {
        (self.batches > 0).then(|| self.loss_sum / self.batches as f64)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub step_loss: f64,
    pub smoothed_loss: f64,
    pub samples: usize,
    pub samples_per_sec: f64,
    pub step_duration: Duration,
}

/// Accumulates the validation pass: one loss per batch plus pixel counts.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    batch_losses: Vec<f64>,
    pixel_count: u64,
    correct_pixels: u64,
}

impl EvaluationMetrics {
    pub fn update(&mut self, loss: f64, pixels: u64, correct: u64) {
        self.batch_losses.push(loss);
        self.pixel_count += pixels;
        self.correct_pixels += correct;
    }

    pub fn finalize(self, epoch: usize) -> Result<EvaluationSummary, TrainingError> {
        let average_loss = mean_loss(&self.batch_losses, epoch)?;
        let pixel_accuracy = if self.pixel_count == 0 {
            0.0
        } else {
            self.correct_pixels as f64 / self.pixel_count as f64
        };
        Ok(EvaluationSummary {
            average_loss,
            pixel_accuracy,
            batches: self.batch_losses.len(),
            pixels: self.pixel_count,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub average_loss: f64,
    pub pixel_accuracy: f64,
    pub batches: usize,
    pub pixels: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_single_batch_is_exact() {
        let loss = 0.693_147_180_559_945_3;
        assert_eq!(mean_loss(&[loss], 0).ok(), Some(loss));
    }

    #[test]
    fn mean_of_nothing_is_an_error() {
        assert!(matches!(
            mean_loss(&[], 4),
            Err(TrainingError::EmptyValidationSet { epoch: 4 })
        ));
        assert!(EvaluationMetrics::default().finalize(4).is_err());
    }

    #[test]
    fn evaluation_summary_averages_batches() {
        let mut metrics = EvaluationMetrics::default();
        metrics.update(1.0, 100, 50);
        metrics.update(3.0, 100, 100);
        let summary = metrics.finalize(0).expect("summary");
        assert_eq!(summary.average_loss, 2.0);
        assert_eq!(summary.pixel_accuracy, 0.75);
        assert_eq!(summary.batches, 2);
    }

    #[test]
    fn ema_starts_at_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(2.0), 3.0);
        assert_eq!(ema.value(), Some(3.0));
    }
}
