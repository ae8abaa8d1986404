//! # sftpack-optim
//!
//! Step budgets and learning rate schedulers sized from packed epochs.

pub mod budget;
pub mod scheduler;

pub use budget::{TrainingBudget, DEFAULT_WARMUP_RATIO};
pub use scheduler::{Constant, CosineAnnealing, LrScheduler, SchedulerKind, WarmupCosine};
