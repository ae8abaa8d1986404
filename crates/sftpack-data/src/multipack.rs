//! Multipack: pack variable-length examples into token-budgeted batches.
//!
//! Instead of a fixed number of examples per step, every batch holds as many
//! examples as fit under `batch_max_length` tokens. The packer only sees
//! example indices and their lengths; the collator fetches the tokens.
//!
//! # Algorithm
//! 1. Walk the epoch permutation in order
//! 2. Append each example to the open batch while the running sum fits
//! 3. Otherwise close the batch and open a new one with that example
//! 4. Emit the last non-empty batch
//!
//! First-fit in permutation order is O(N) and has no tie-breaking, so every
//! replica computes the same plan from the same permutation.

use serde::Serialize;
use sftpack_core::{LengthTable, PackError, PackingVersion, Result};

/// One training step's worth of example indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    indices: Vec<usize>,
    num_tokens: usize,
}

impl Batch {
    /// Example indices in the order they were packed.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Sum of the member examples' lengths.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// Number of examples in this batch.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Always false for batches produced by the packer.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Consume the batch, keeping only its indices.
    pub fn into_indices(self) -> Vec<usize> {
        self.indices
    }
}

/// Ordered global batch sequence for one epoch, before replica sharding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackingPlan {
    batches: Vec<Batch>,
    batch_max_length: usize,
    version: PackingVersion,
}

impl PackingPlan {
    /// Number of batches in the global plan.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// True only for an empty dataset.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Batches in global order.
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Batch at global position `k`.
    pub fn get(&self, k: usize) -> Option<&Batch> {
        self.batches.get(k)
    }

    /// Iterate batches in global order.
    pub fn iter(&self) -> std::slice::Iter<'_, Batch> {
        self.batches.iter()
    }

    /// Token budget the plan was packed under.
    pub fn batch_max_length(&self) -> usize {
        self.batch_max_length
    }

    /// Algorithm version that produced the plan.
    pub fn version(&self) -> PackingVersion {
        self.version
    }

    /// Total tokens across all batches.
    pub fn total_tokens(&self) -> usize {
        self.batches.iter().map(|b| b.num_tokens).sum()
    }

    /// Packing efficiency: used tokens / total capacity.
    pub fn efficiency(&self) -> f64 {
        if self.batches.is_empty() {
            return 0.0;
        }
        let used: f64 = self.batches.iter().map(|b| b.num_tokens as f64).sum();
        used / (self.batches.len() as f64 * self.batch_max_length as f64)
    }

    /// Plain index lists, one per batch.
    pub fn index_lists(&self) -> Vec<Vec<usize>> {
        self.batches.iter().map(|b| b.indices.clone()).collect()
    }
}

impl<'a> IntoIterator for &'a PackingPlan {
    type Item = &'a Batch;
    type IntoIter = std::slice::Iter<'a, Batch>;

    fn into_iter(self) -> Self::IntoIter {
        self.batches.iter()
    }
}

/// Greedy first-fit packer over a fixed token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPacker {
    /// Maximum tokens per batch.
    pub batch_max_length: usize,
    pub version: PackingVersion,
}

impl BatchPacker {
    /// Create a packer. Fails if `batch_max_length` is zero.
    pub fn new(batch_max_length: usize, version: PackingVersion) -> Result<Self> {
        if batch_max_length == 0 {
            return Err(PackError::ConfigError("batch_max_length must be > 0".into()));
        }
        Ok(Self { batch_max_length, version })
    }

    /// Fail if any example can never fit in a batch.
    ///
    /// Reports the lowest offending index so every worker raises the same
    /// error regardless of permutation.
    pub fn check_fits(&self, lengths: &LengthTable) -> Result<()> {
        match lengths.iter().enumerate().find(|&(_, l)| l > self.batch_max_length) {
            Some((index, length)) => Err(PackError::OversizedExample {
                index,
                length,
                batch_max_length: self.batch_max_length,
            }),
            None => Ok(()),
        }
    }

    /// Pack `order` (a permutation of example indices) into batches.
    ///
    /// The whole plan is built before returning, so an oversized example
    /// fails the call and no batch escapes. An index outside `lengths` is a
    /// `ConfigError`.
    pub fn pack(&self, order: &[usize], lengths: &LengthTable) -> Result<PackingPlan> {
        match self.version {
            PackingVersion::V1 => self.pack_first_fit(order, lengths),
        }
    }

    fn pack_first_fit(&self, order: &[usize], lengths: &LengthTable) -> Result<PackingPlan> {
        let budget = self.batch_max_length;
        let mut batches: Vec<Batch> = Vec::new();
        let mut open: Vec<usize> = Vec::new();
        let mut running = 0usize;

        for &idx in order {
            let len = lengths.as_slice().get(idx).copied().ok_or_else(|| {
                PackError::ConfigError(format!(
                    "order index {idx} out of range for {} examples",
                    lengths.len()
                ))
            })?;
            if len > budget {
                return Err(PackError::OversizedExample {
                    index: idx,
                    length: len,
                    batch_max_length: budget,
                });
            }

            // running <= budget always holds, so the subtraction cannot wrap
            if len <= budget - running {
                open.push(idx);
                running += len;
            } else {
                // running > 0 here since len <= budget, so the closed batch is non-empty
                batches.push(Batch { indices: std::mem::take(&mut open), num_tokens: running });
                open.push(idx);
                running = len;
            }
        }

        if !open.is_empty() {
            batches.push(Batch { indices: open, num_tokens: running });
        }

        Ok(PackingPlan { batches, batch_max_length: budget, version: self.version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn packer(max: usize) -> BatchPacker {
        BatchPacker::new(max, PackingVersion::V1).unwrap()
    }

    fn table(lengths: &[usize]) -> LengthTable {
        LengthTable::new(lengths.to_vec()).unwrap()
    }

    #[test]
    fn test_equal_pairs() {
        let plan = packer(10).pack(&[0, 1, 2, 3], &table(&[5, 5, 5, 5])).unwrap();
        assert_eq!(plan.index_lists(), vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(plan.batches()[0].num_tokens(), 10);
        assert_eq!(plan.batches()[1].num_tokens(), 10);
    }

    #[test]
    fn test_exact_fit_then_overflow() {
        let plan = packer(10).pack(&[0, 1, 2, 3], &table(&[7, 3, 9, 2])).unwrap();
        // 7+3 fits exactly; 9+2 overflows so 2 stands alone and 3 opens the last batch
        assert_eq!(plan.index_lists(), vec![vec![0, 1], vec![2], vec![3]]);
    }

    #[test]
    fn test_no_lookback() {
        // A closed batch is never reopened, even when a later example would fit it.
        let plan = packer(10).pack(&[0, 1, 2], &table(&[6, 8, 4])).unwrap();
        assert_eq!(plan.index_lists(), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_order_is_respected() {
        let plan = packer(10).pack(&[3, 2, 1, 0], &table(&[5, 5, 5, 5])).unwrap();
        assert_eq!(plan.index_lists(), vec![vec![3, 2], vec![1, 0]]);
    }

    #[test]
    fn test_empty_dataset() {
        let plan = packer(10).pack(&[], &table(&[])).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.efficiency(), 0.0);
    }

    #[test]
    fn test_all_full_length() {
        let plan = packer(8).pack(&[0, 1, 2], &table(&[8, 8, 8])).unwrap();
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|b| b.len() == 1));
        assert!((plan.efficiency() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_underfull_tail_kept() {
        let plan = packer(10).pack(&[0, 1, 2], &table(&[6, 6, 1])).unwrap();
        assert_eq!(plan.index_lists(), vec![vec![0], vec![1, 2]]);
        let plan = packer(10).pack(&[0, 1, 2], &table(&[9, 9, 1])).unwrap();
        assert_eq!(plan.index_lists(), vec![vec![0], vec![1, 2]]);
        let plan = packer(10).pack(&[0, 1], &table(&[9, 2])).unwrap();
        assert_eq!(plan.index_lists(), vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_oversized_rejected() {
        let lengths = table(&[3, 11, 2]);
        let err = packer(10).pack(&[0, 1, 2], &lengths).unwrap_err();
        match err {
            PackError::OversizedExample { index, length, batch_max_length } => {
                assert_eq!(index, 1);
                assert_eq!(length, 11);
                assert_eq!(batch_max_length, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(packer(10).check_fits(&lengths).unwrap_err().is_oversized());
        assert!(packer(11).check_fits(&lengths).is_ok());
    }

    #[test]
    fn test_zero_budget_rejected() {
        assert!(BatchPacker::new(0, PackingVersion::V1).unwrap_err().is_config());
    }

    #[test]
    fn test_efficiency() {
        let plan = packer(10).pack(&[0, 1, 2, 3], &table(&[7, 3, 9, 2])).unwrap();
        // 21 tokens over 3 batches of capacity 10
        assert!((plan.efficiency() - 0.7).abs() < 1e-12);
        assert_eq!(plan.total_tokens(), 21);
    }

    #[test]
    fn test_order_index_out_of_range() {
        let err = packer(10).pack(&[0, 3], &table(&[1, 2])).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_budget_near_usize_max() {
        let big = usize::MAX;
        let plan = packer(big).pack(&[0, 1, 2], &table(&[big - 1, 1, 5])).unwrap();
        assert_eq!(plan.index_lists(), vec![vec![0, 1], vec![2]]);
        assert_eq!(plan.batches()[0].num_tokens(), big);
        assert!((plan.efficiency() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_v1_golden_plan() {
        // Locks the v1 output; a change here breaks workers on mixed releases.
        let lengths = table(&[3, 7, 2, 9, 4, 4, 8, 1, 6, 5, 2, 7, 3, 9, 1, 5]);
        let order = crate::permutation::epoch_permutation(877645, 0, lengths.len());
        let plan = packer(12).pack(&order, &lengths).unwrap();
        assert_eq!(
            plan.index_lists(),
            vec![
                vec![9, 12, 7],
                vec![15, 5, 0],
                vec![8, 2, 14],
                vec![13],
                vec![6],
                vec![3],
                vec![11, 10],
                vec![4, 1],
            ]
        );
        let tokens: Vec<usize> = plan.iter().map(|b| b.num_tokens()).collect();
        assert_eq!(tokens, vec![9, 12, 9, 9, 8, 9, 9, 11]);
    }

    proptest! {
        #[test]
        fn prop_coverage_and_budget(
            lengths in prop::collection::vec(1usize..=64, 0..300),
            budget in 64usize..512,
            seed in any::<u64>(),
            epoch in 0u64..16,
        ) {
            let n = lengths.len();
            let lengths = LengthTable::new(lengths).unwrap();
            let order = crate::permutation::epoch_permutation(seed, epoch, n);
            let plan = packer(budget).pack(&order, &lengths).unwrap();

            let mut seen = vec![false; n];
            for batch in &plan {
                prop_assert!(!batch.is_empty());
                let sum: usize = batch.indices().iter().map(|&i| lengths.get(i)).sum();
                prop_assert_eq!(sum, batch.num_tokens());
                prop_assert!(sum <= budget);
                for &i in batch.indices() {
                    prop_assert!(!seen[i]);
                    seen[i] = true;
                }
            }
            prop_assert!(seen.iter().all(|&s| s));
        }

        #[test]
        fn prop_deterministic(
            lengths in prop::collection::vec(1usize..=32, 0..200),
            seed in any::<u64>(),
        ) {
            let n = lengths.len();
            let lengths = LengthTable::new(lengths).unwrap();
            let order = crate::permutation::epoch_permutation(seed, 1, n);
            let a = packer(64).pack(&order, &lengths).unwrap();
            let b = packer(64).pack(&order, &lengths).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
