//! Error types for sftpack.

use thiserror::Error;

/// Errors raised while configuring or building a packing plan.
///
/// Every variant is a deterministic failure: the same inputs fail the same
/// way on every worker, so nothing here is worth retrying.
#[derive(Debug, Error)]
pub enum PackError {
    /// Invalid configuration or input data (zero budget, bad rank,
    /// non-positive example length).
    #[error("config error: {0}")]
    ConfigError(String),

    /// A single example is longer than the per-batch token budget.
    #[error(
        "example {index} has length {length}, which exceeds batch_max_length {batch_max_length}"
    )]
    OversizedExample {
        index: usize,
        length: usize,
        batch_max_length: usize,
    },

    /// Reading or parsing lengths, datasets, or config files failed.
    #[error("storage error: {0}")]
    StorageError(String),
}

impl PackError {
    /// Whether this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, PackError::ConfigError(_))
    }

    /// Whether this is an oversized-example error.
    pub fn is_oversized(&self) -> bool {
        matches!(self, PackError::OversizedExample { .. })
    }
}
