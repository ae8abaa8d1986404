//! Learning rate schedulers.
//!
//! Sized from the packed step count: with multipack batching the number of
//! steps per epoch comes from the sampler, not from `len(dataset) / batch_size`.

use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;

use crate::budget::TrainingBudget;

/// Trait for learning rate schedulers.
pub trait LrScheduler {
    /// Get the learning rate for the current step.
    fn get_lr(&self, step: usize) -> f32;

    /// Total number of steps.
    fn total_steps(&self) -> usize;
}

/// Cosine annealing scheduler: lr decays from `lr_max` to `lr_min` over `total_steps`.
///
/// lr(t) = lr_min + 0.5 * (lr_max - lr_min) * (1 + cos(pi * t / T))
pub struct CosineAnnealing {
    lr_max: f32,
    lr_min: f32,
    total: usize,
}

impl CosineAnnealing {
    pub fn new(lr_max: f32, lr_min: f32, total_steps: usize) -> Self {
        Self {
            lr_max,
            lr_min,
            total: total_steps,
        }
    }
}

impl LrScheduler for CosineAnnealing {
    fn get_lr(&self, step: usize) -> f32 {
        if step >= self.total {
            return self.lr_min;
        }
        let progress = step as f32 / self.total as f32;
        self.lr_min + 0.5 * (self.lr_max - self.lr_min) * (1.0 + (PI * progress).cos())
    }

    fn total_steps(&self) -> usize {
        self.total
    }
}

/// Warmup + cosine annealing scheduler.
///
/// Linear warmup from `lr_start` to `lr_max` over `warmup_steps`,
/// then cosine decay from `lr_max` to `lr_min` over the remaining steps.
pub struct WarmupCosine {
    lr_start: f32,
    lr_max: f32,
    lr_min: f32,
    warmup_steps: usize,
    total: usize,
}

impl WarmupCosine {
    /// `warmup_steps` is clamped below `total_steps` so short runs still decay.
    pub fn new(
        lr_start: f32,
        lr_max: f32,
        lr_min: f32,
        warmup_steps: usize,
        total_steps: usize,
    ) -> Self {
        Self {
            lr_start,
            lr_max,
            lr_min,
            warmup_steps: warmup_steps.min(total_steps.saturating_sub(1)),
            total: total_steps,
        }
    }

    /// Warmup from 0 to `lr`, then cosine decay to 0, sized by `budget`.
    pub fn from_budget(lr: f32, budget: &TrainingBudget) -> Self {
        Self::new(0.0, lr, 0.0, budget.warmup_steps(), budget.total_steps())
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}

impl LrScheduler for WarmupCosine {
    fn get_lr(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            // Linear warmup
            let progress = step as f32 / self.warmup_steps as f32;
            self.lr_start + (self.lr_max - self.lr_start) * progress
        } else if step >= self.total {
            self.lr_min
        } else {
            // Cosine decay
            let decay_steps = self.total - self.warmup_steps;
            let decay_step = step - self.warmup_steps;
            let progress = decay_step as f32 / decay_steps as f32;
            self.lr_min + 0.5 * (self.lr_max - self.lr_min) * (1.0 + (PI * progress).cos())
        }
    }

    fn total_steps(&self) -> usize {
        self.total
    }
}

/// Constant learning rate.
pub struct Constant {
    lr: f32,
    total: usize,
}

impl Constant {
    pub fn new(lr: f32, total_steps: usize) -> Self {
        Self { lr, total: total_steps }
    }
}

impl LrScheduler for Constant {
    fn get_lr(&self, _step: usize) -> f32 {
        self.lr
    }

    fn total_steps(&self) -> usize {
        self.total
    }
}

/// Scheduler selected by name on the command line or in a run config.
///
/// `cosine` warms up over the budget's warmup steps and then decays, which is
/// what fine-tuning recipes mean by a cosine schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Linear warmup, then cosine decay to zero.
    Cosine,
    /// Cosine decay from the first step, no warmup.
    CosineNoWarmup,
    Constant,
}

impl SchedulerKind {
    /// Whether the built scheduler spends `budget.warmup_steps()` warming up.
    pub fn uses_warmup(self) -> bool {
        matches!(self, SchedulerKind::Cosine)
    }

    /// Build the scheduler for peak learning rate `lr` over `budget`.
    pub fn build(self, lr: f32, budget: &TrainingBudget) -> Box<dyn LrScheduler> {
        match self {
            SchedulerKind::Cosine => Box::new(WarmupCosine::from_budget(lr, budget)),
            SchedulerKind::CosineNoWarmup => {
                Box::new(CosineAnnealing::new(lr, 0.0, budget.total_steps()))
            }
            SchedulerKind::Constant => Box::new(Constant::new(lr, budget.total_steps())),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" | "warmup_cosine" => Ok(SchedulerKind::Cosine),
            "cosine_no_warmup" => Ok(SchedulerKind::CosineNoWarmup),
            "constant" | "none" => Ok(SchedulerKind::Constant),
            other => Err(format!(
                "unknown scheduler {other:?}; expected cosine, cosine_no_warmup or constant"
            )),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerKind::Cosine => "cosine",
            SchedulerKind::CosineNoWarmup => "cosine_no_warmup",
            SchedulerKind::Constant => "constant",
        };
        f.write_str(name)
    }
}
