//! ReplicaSharder: split a global plan across data-parallel workers.
//!
//! Every worker computes the same global plan and keeps only its own slice.
//! The trailing `B mod num_replicas` batches are dropped so all workers run
//! the same number of steps; the rest are dealt round-robin, which keeps each
//! worker's token volume balanced across the epoch.

use std::sync::Arc;

use sftpack_core::{PackError, PackerConfig, Result};

use crate::multipack::{Batch, PackingPlan};

/// Round-robin assignment of global batch positions to one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaSharder {
    num_replicas: usize,
    rank: usize,
}

impl ReplicaSharder {
    /// Fails unless `num_replicas >= 1` and `rank < num_replicas`.
    pub fn new(num_replicas: usize, rank: usize) -> Result<Self> {
        if num_replicas == 0 {
            return Err(PackError::ConfigError("num_replicas must be >= 1".into()));
        }
        if rank >= num_replicas {
            return Err(PackError::ConfigError(format!(
                "rank {rank} out of range [0, {num_replicas})"
            )));
        }
        Ok(Self { num_replicas, rank })
    }

    /// Identity sharder for single-process runs.
    pub fn identity() -> Self {
        Self { num_replicas: 1, rank: 0 }
    }

    /// Sharder for a config, honoring `use_distributed_shuffle`.
    pub fn from_config(config: &PackerConfig) -> Result<Self> {
        let (num_replicas, rank) = config.effective_replicas();
        Self::new(num_replicas, rank)
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Global batches kept this epoch: `total - total % num_replicas`.
    pub fn usable(&self, total: usize) -> usize {
        total - total % self.num_replicas
    }

    /// Batches each replica receives. Identical on every rank.
    pub fn per_replica(&self, total: usize) -> usize {
        self.usable(total) / self.num_replicas
    }

    /// Global positions owned by this rank, in step order.
    pub fn positions(&self, total: usize) -> impl Iterator<Item = usize> {
        (self.rank..self.usable(total)).step_by(self.num_replicas)
    }

    /// This rank's batches, cloned out of `plan`.
    pub fn shard(&self, plan: &PackingPlan) -> Vec<Batch> {
        self.positions(plan.len())
            .map(|k| plan.batches()[k].clone())
            .collect()
    }

    /// Lazy iterator over this rank's batches of a shared plan.
    pub fn iter_shared(&self, plan: Arc<PackingPlan>) -> ReplicaBatches {
        let remaining = self.per_replica(plan.len());
        ReplicaBatches {
            plan,
            next: self.rank,
            stride: self.num_replicas,
            remaining,
        }
    }
}

/// Iterator over one replica's batches for an epoch.
///
/// Holds the epoch's plan by `Arc`, so it stays valid after the session
/// moves to another epoch.
#[derive(Debug, Clone)]
pub struct ReplicaBatches {
    plan: Arc<PackingPlan>,
    next: usize,
    stride: usize,
    remaining: usize,
}

impl Iterator for ReplicaBatches {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let batch = self.plan.get(self.next)?.clone();
        self.next += self.stride;
        self.remaining -= 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for ReplicaBatches {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipack::BatchPacker;
    use sftpack_core::{LengthTable, PackingVersion};

    /// Plan of `n` single-example batches, where batch `k` holds example `k`.
    fn singleton_plan(n: usize) -> PackingPlan {
        let lengths = LengthTable::new(vec![4; n]).unwrap();
        let order: Vec<usize> = (0..n).collect();
        BatchPacker::new(4, PackingVersion::V1).unwrap().pack(&order, &lengths).unwrap()
    }

    fn firsts(batches: &[Batch]) -> Vec<usize> {
        batches.iter().map(|b| b.indices()[0]).collect()
    }

    #[test]
    fn test_two_replicas_five_batches() {
        let plan = singleton_plan(5);
        let r0 = ReplicaSharder::new(2, 0).unwrap();
        let r1 = ReplicaSharder::new(2, 1).unwrap();

        assert_eq!(r0.usable(5), 4);
        assert_eq!(r0.per_replica(5), 2);
        assert_eq!(r1.per_replica(5), 2);
        assert_eq!(firsts(&r0.shard(&plan)), vec![0, 2]);
        assert_eq!(firsts(&r1.shard(&plan)), vec![1, 3]);
    }

    #[test]
    fn test_identity() {
        let plan = singleton_plan(7);
        let sharder = ReplicaSharder::identity();
        assert_eq!(sharder.usable(7), 7);
        assert_eq!(sharder.shard(&plan), plan.batches().to_vec());
    }

    #[test]
    fn test_fewer_batches_than_replicas() {
        let plan = singleton_plan(3);
        for rank in 0..4 {
            let sharder = ReplicaSharder::new(4, rank).unwrap();
            assert_eq!(sharder.per_replica(3), 0);
            assert!(sharder.shard(&plan).is_empty());
        }
    }

    #[test]
    fn test_union_is_usable_prefix() {
        let plan = singleton_plan(23);
        let replicas = 4;
        let mut all: Vec<usize> = Vec::new();
        for rank in 0..replicas {
            let sharder = ReplicaSharder::new(replicas, rank).unwrap();
            let mine = sharder.shard(&plan);
            assert_eq!(mine.len(), 5);
            all.extend(firsts(&mine));
        }
        all.sort_unstable();
        assert_eq!(all, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_iter_shared_matches_shard() {
        let plan = Arc::new(singleton_plan(11));
        let sharder = ReplicaSharder::new(3, 2).unwrap();
        let iter = sharder.iter_shared(plan.clone());
        assert_eq!(iter.len(), 3);
        let lazy: Vec<Batch> = iter.collect();
        assert_eq!(lazy, sharder.shard(&plan));
        assert_eq!(firsts(&lazy), vec![2, 5, 8]);
    }

    #[test]
    fn test_invalid_rank() {
        assert!(ReplicaSharder::new(2, 2).unwrap_err().is_config());
        assert!(ReplicaSharder::new(0, 0).unwrap_err().is_config());
    }

    #[test]
    fn test_from_config_single_process() {
        let cfg = PackerConfig { num_replicas: 4, rank: 3, ..PackerConfig::single(8, 0) };
        assert_eq!(ReplicaSharder::from_config(&cfg).unwrap(), ReplicaSharder::identity());
        let cfg = PackerConfig::distributed(8, 4, 3, 0);
        let sharder = ReplicaSharder::from_config(&cfg).unwrap();
        assert_eq!((sharder.num_replicas(), sharder.rank()), (4, 3));
    }
}
