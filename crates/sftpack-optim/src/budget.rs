//! Training step budget derived from the sampler's per-epoch batch count.

use serde::Serialize;

/// Fraction of total steps spent warming up when none is given.
pub const DEFAULT_WARMUP_RATIO: f64 = 0.05;

/// Step counts for a run: steps per epoch come from `num_batches()`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainingBudget {
    pub steps_per_epoch: usize,
    pub epochs: usize,
    pub warmup_ratio: f64,
}

impl TrainingBudget {
    pub fn new(steps_per_epoch: usize, epochs: usize) -> Self {
        Self { steps_per_epoch, epochs, warmup_ratio: DEFAULT_WARMUP_RATIO }
    }

    pub fn with_warmup_ratio(mut self, warmup_ratio: f64) -> Self {
        self.warmup_ratio = warmup_ratio;
        self
    }

    /// `steps_per_epoch * epochs`.
    pub fn total_steps(&self) -> usize {
        self.steps_per_epoch.saturating_mul(self.epochs)
    }

    /// `ceil(total_steps * warmup_ratio)`.
    pub fn warmup_steps(&self) -> usize {
        (self.total_steps() as f64 * self.warmup_ratio).ceil() as usize
    }

    /// Whether to evaluate after 1-based `step` of an epoch, running
    /// `times_per_epoch` evaluations per epoch.
    ///
    /// Epochs shorter than `times_per_epoch` evaluate after every step.
    pub fn should_run_eval(&self, step: usize, times_per_epoch: usize) -> bool {
        if times_per_epoch == 0 {
            return false;
        }
        let interval = (self.steps_per_epoch / times_per_epoch).max(1);
        step % interval == 0
    }

    /// Fractional epoch for progress display: `epoch + round(step / steps_per_epoch, 2)`.
    pub fn progress_epoch(&self, epoch: usize, step: usize) -> f64 {
        if self.steps_per_epoch == 0 {
            return epoch as f64;
        }
        let frac = step as f64 / self.steps_per_epoch as f64;
        epoch as f64 + (frac * 100.0).round() / 100.0
    }
}
