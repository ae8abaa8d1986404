//! Packer configuration.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{PackError, Result};

/// Version tag for the shuffle + packing algorithm.
///
/// Workers that disagree on the version compute different plans and
/// desynchronize, so the tag is stored with the run configuration and
/// unknown tags are rejected at deserialization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackingVersion {
    /// ChaCha8 seeded with `seed.wrapping_add(epoch)`, Fisher–Yates shuffle,
    /// greedy first-fit in permutation order, round-robin replica sharding.
    #[default]
    V1,
}

impl PackingVersion {
    /// One-line description of the pinned algorithm.
    pub fn describe(&self) -> &'static str {
        match self {
            PackingVersion::V1 => {
                "chacha8(seed + epoch) fisher-yates; greedy first-fit; round-robin shards"
            }
        }
    }
}

impl fmt::Display for PackingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackingVersion::V1 => write!(f, "v1"),
        }
    }
}

/// Configuration for the distributed batch packer.
///
/// Every worker must share `batch_max_length`, `num_replicas`, `seed` and
/// `version`; only `rank` differs between workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackerConfig {
    /// Token budget per batch.
    pub batch_max_length: usize,

    /// Number of data-parallel workers.
    #[serde(default = "default_num_replicas")]
    pub num_replicas: usize,

    /// This worker's id in `[0, num_replicas)`.
    #[serde(default)]
    pub rank: usize,

    /// Base randomness seed.
    #[serde(default)]
    pub seed: u64,

    /// When false, sharding is disabled and this worker sees the whole plan.
    #[serde(default)]
    pub use_distributed_shuffle: bool,

    /// Pinned algorithm version.
    #[serde(default)]
    pub version: PackingVersion,
}

fn default_num_replicas() -> usize {
    1
}

impl PackerConfig {
    /// Single-process config: one replica, rank 0, no sharding.
    pub fn single(batch_max_length: usize, seed: u64) -> Self {
        Self {
            batch_max_length,
            num_replicas: 1,
            rank: 0,
            seed,
            use_distributed_shuffle: false,
            version: PackingVersion::V1,
        }
    }

    /// Sharded config for `rank` out of `num_replicas` workers.
    pub fn distributed(
        batch_max_length: usize,
        num_replicas: usize,
        rank: usize,
        seed: u64,
    ) -> Self {
        Self {
            batch_max_length,
            num_replicas,
            rank,
            seed,
            use_distributed_shuffle: true,
            version: PackingVersion::V1,
        }
    }

    /// Derive the token budget as `batch_size * max_length`.
    ///
    /// Fails with `ConfigError` if the product overflows `usize`.
    pub fn from_batch_size(batch_size: usize, max_length: usize, seed: u64) -> Result<Self> {
        let budget = batch_size.checked_mul(max_length).ok_or_else(|| {
            PackError::ConfigError(format!(
                "batch_size {batch_size} * max_length {max_length} overflows usize"
            ))
        })?;
        Ok(Self::single(budget, seed))
    }

    /// Return a copy of this config for a different rank.
    pub fn with_rank(&self, rank: usize) -> Self {
        Self { rank, ..self.clone() }
    }

    /// Load a config from a JSON file. The result is validated.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PackError::StorageError(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            PackError::StorageError(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config invariants.
    pub fn validate(&self) -> Result<()> {
        if self.batch_max_length == 0 {
            return Err(PackError::ConfigError("batch_max_length must be > 0".into()));
        }
        if self.num_replicas == 0 {
            return Err(PackError::ConfigError("num_replicas must be >= 1".into()));
        }
        if self.rank >= self.num_replicas {
            return Err(PackError::ConfigError(format!(
                "rank {} out of range [0, {})",
                self.rank, self.num_replicas
            )));
        }
        Ok(())
    }

    /// `(num_replicas, rank)` after applying `use_distributed_shuffle`.
    ///
    /// Single-process mode always behaves as one replica at rank 0.
    pub fn effective_replicas(&self) -> (usize, usize) {
        if self.use_distributed_shuffle {
            (self.num_replicas, self.rank)
        } else {
            (1, 0)
        }
    }
}
