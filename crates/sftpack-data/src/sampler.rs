//! SamplerSession: the epoch-aware batch sampler a training loop drives.
//!
//! One session per worker per run. The session owns the packer config and
//! the dataset's lengths; each epoch it derives the global plan from
//! `(seed, epoch)` and hands out only this rank's batches.

use std::sync::Arc;

use parking_lot::Mutex;
use sftpack_core::{LengthTable, PackerConfig, Result};

use crate::multipack::{Batch, BatchPacker, PackingPlan};
use crate::permutation::EpochPermutation;
use crate::sharder::{ReplicaBatches, ReplicaSharder};

/// Distributed length-aware batch sampler.
///
/// # Example (Rust)
/// ```ignore
/// use sftpack_core::{LengthTable, PackerConfig};
/// use sftpack_data::SamplerSession;
///
/// let lengths = LengthTable::new(lengths_from_tokenizer)?;
/// let config = PackerConfig::distributed(4 * 2048, world_size, rank, 877645);
/// let mut sampler = SamplerSession::new(config, lengths)?;
///
/// let steps_per_epoch = sampler.num_batches()?;
/// for epoch in 0..epochs {
///     sampler.set_epoch(epoch);
///     for batch in sampler.iter()? {
///         // batch.indices() -> collator
///     }
/// }
/// ```
pub struct SamplerSession {
    config: PackerConfig,
    lengths: Arc<LengthTable>,
    packer: BatchPacker,
    permutation: EpochPermutation,
    sharder: ReplicaSharder,
    epoch: u64,
    // Plan for `epoch`, built on first use.
    cache: Mutex<Option<(u64, Arc<PackingPlan>)>>,
}

impl SamplerSession {
    /// Create a session at epoch 0.
    ///
    /// Validates the config and rejects any example longer than
    /// `batch_max_length` up front, so a bad run fails before the first step.
    pub fn new(config: PackerConfig, lengths: LengthTable) -> Result<Self> {
        Self::with_shared_lengths(config, Arc::new(lengths))
    }

    /// Like `new`, sharing an existing length table (e.g. across simulated ranks).
    pub fn with_shared_lengths(config: PackerConfig, lengths: Arc<LengthTable>) -> Result<Self> {
        config.validate()?;
        let packer = BatchPacker::new(config.batch_max_length, config.version)?;
        packer.check_fits(&lengths)?;
        let sharder = ReplicaSharder::from_config(&config)?;
        let permutation = EpochPermutation::new(config.seed, config.version);

        tracing::debug!(
            examples = lengths.len(),
            batch_max_length = config.batch_max_length,
            num_replicas = sharder.num_replicas(),
            rank = sharder.rank(),
            version = %config.version,
            "sampler session created"
        );

        Ok(Self {
            config,
            lengths,
            packer,
            permutation,
            sharder,
            epoch: 0,
            cache: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PackerConfig {
        &self.config
    }

    pub fn lengths(&self) -> &LengthTable {
        &self.lengths
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Select the epoch for subsequent iteration.
    ///
    /// Call once per epoch before drawing the first batch. Forgetting to call
    /// it replays the previous epoch's order.
    pub fn set_epoch(&mut self, epoch: u64) {
        if self.epoch != epoch {
            *self.cache.get_mut() = None;
        }
        self.epoch = epoch;
    }

    /// Build the global plan for `epoch`, independent of the session's epoch.
    pub fn plan_for_epoch(&self, epoch: u64) -> Result<PackingPlan> {
        let order = self.permutation.permutation(epoch, self.lengths.len());
        let plan = self.packer.pack(&order, &self.lengths)?;
        tracing::debug!(
            epoch,
            batches = plan.len(),
            usable = self.sharder.usable(plan.len()),
            efficiency = plan.efficiency(),
            "packed epoch"
        );
        Ok(plan)
    }

    /// Global plan for the current epoch, shared with any live iterators.
    pub fn plan(&self) -> Result<Arc<PackingPlan>> {
        let mut cache = self.cache.lock();
        if let Some((epoch, plan)) = cache.as_ref() {
            if *epoch == self.epoch {
                return Ok(Arc::clone(plan));
            }
        }
        let plan = Arc::new(self.plan_for_epoch(self.epoch)?);
        *cache = Some((self.epoch, Arc::clone(&plan)));
        Ok(plan)
    }

    /// Batches this replica runs in the current epoch.
    ///
    /// Identical on every rank for the same seed, epoch, budget and replica
    /// count.
    pub fn num_batches(&self) -> Result<usize> {
        Ok(self.sharder.per_replica(self.plan()?.len()))
    }

    /// Global packing efficiency for the current epoch.
    pub fn efficiency(&self) -> Result<f64> {
        Ok(self.plan()?.efficiency())
    }

    /// This rank's batches for the current epoch, in step order.
    ///
    /// Calling again within the same epoch replays the same batches.
    pub fn iter(&self) -> Result<ReplicaBatches> {
        Ok(self.sharder.iter_shared(self.plan()?))
    }

    /// This rank's batches collected into a `Vec`.
    pub fn batches(&self) -> Result<Vec<Batch>> {
        Ok(self.iter()?.collect())
    }

    pub fn sharder(&self) -> &ReplicaSharder {
        &self.sharder
    }
}
