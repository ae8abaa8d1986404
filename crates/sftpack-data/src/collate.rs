//! Collation: turn a packed batch of indices into model-ready rows.
//!
//! Two layouts are supported:
//! - `PaddedCollator`: one row per example, right-padded to the longest
//!   member, labels on padding set to the ignore index
//! - `PackedBatch`: all examples concatenated into one row with sequence
//!   boundaries and a block-causal attention mask

use sftpack_core::{PackError, Result};

use crate::dataset::{Example, TokenizedDataset};
use crate::multipack::Batch;

/// Label value skipped by cross-entropy.
pub const IGNORE_INDEX: i64 = -100;

fn lookup<'a>(dataset: &'a TokenizedDataset, index: usize) -> Result<&'a Example> {
    dataset.get(index).ok_or_else(|| {
        PackError::ConfigError(format!(
            "batch index {index} out of range for dataset of {} examples",
            dataset.len()
        ))
    })
}

fn example_labels(example: &Example) -> Vec<i64> {
    match &example.labels {
        Some(labels) => labels.clone(),
        None => example.input_ids.iter().map(|&t| t as i64).collect(),
    }
}

/// Right-padded rows for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedBatch {
    /// `[batch_size][seq_len]` token ids.
    pub input_ids: Vec<Vec<u32>>,
    /// `[batch_size][seq_len]` labels, `ignore_index` on padding.
    pub labels: Vec<Vec<i64>>,
    /// `[batch_size][seq_len]`, 1 for real tokens and 0 for padding.
    pub attention_mask: Vec<Vec<u8>>,
    pub seq_len: usize,
}

impl PaddedBatch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.len()
    }
}

/// Pads every example in a batch to the longest one.
#[derive(Debug, Clone, Copy)]
pub struct PaddedCollator {
    pub pad_token_id: u32,
    pub ignore_index: i64,
}

impl PaddedCollator {
    pub fn new(pad_token_id: u32) -> Self {
        Self { pad_token_id, ignore_index: IGNORE_INDEX }
    }

    /// Collate the examples named by `batch`.
    pub fn collate(&self, dataset: &TokenizedDataset, batch: &Batch) -> Result<PaddedBatch> {
        let examples = batch
            .indices()
            .iter()
            .map(|&i| lookup(dataset, i))
            .collect::<Result<Vec<_>>>()?;

        let seq_len = examples.iter().map(|e| e.input_ids.len()).max().unwrap_or(0);
        let mut input_ids = Vec::with_capacity(examples.len());
        let mut labels = Vec::with_capacity(examples.len());
        let mut attention_mask = Vec::with_capacity(examples.len());

        for example in examples {
            let n = example.input_ids.len();

            let mut ids = vec![self.pad_token_id; seq_len];
            ids[..n].copy_from_slice(&example.input_ids);

            let mut lab = vec![self.ignore_index; seq_len];
            let src = example_labels(example);
            let m = src.len().min(n);
            lab[..m].copy_from_slice(&src[..m]);

            let mut mask = vec![0u8; seq_len];
            mask[..n].fill(1);

            input_ids.push(ids);
            labels.push(lab);
            attention_mask.push(mask);
        }

        Ok(PaddedBatch { input_ids, labels, attention_mask, seq_len })
    }
}

/// A packed batch: member sequences concatenated with their boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedBatch {
    /// Concatenated token ids.
    pub tokens: Vec<u32>,
    /// Concatenated labels.
    pub labels: Vec<i64>,
    /// Sequence boundaries: `boundaries[i]..boundaries[i+1]` is sequence i.
    pub boundaries: Vec<usize>,
    /// Number of sequences packed into this row.
    pub num_sequences: usize,
}

impl PackedBatch {
    /// Concatenate the examples named by `batch`, in batch order.
    pub fn from_batch(dataset: &TokenizedDataset, batch: &Batch) -> Result<Self> {
        let mut packed = PackedBatch {
            tokens: Vec::with_capacity(batch.num_tokens()),
            labels: Vec::with_capacity(batch.num_tokens()),
            boundaries: vec![0],
            num_sequences: 0,
        };

        for &idx in batch.indices() {
            let example = lookup(dataset, idx)?;
            let n = example.input_ids.len();
            packed.tokens.extend_from_slice(&example.input_ids);

            let mut lab = example_labels(example);
            lab.resize(n, IGNORE_INDEX);
            packed.labels.extend(lab);

            packed.boundaries.push(packed.tokens.len());
            packed.num_sequences += 1;
        }

        Ok(packed)
    }

    /// Total number of tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Get the i-th sequence's tokens.
    pub fn sequence(&self, i: usize) -> &[u32] {
        &self.tokens[self.boundaries[i]..self.boundaries[i + 1]]
    }

    /// Position ids restarting at 0 at every sequence boundary.
    pub fn position_ids(&self) -> Vec<usize> {
        let mut pos = Vec::with_capacity(self.tokens.len());
        for w in self.boundaries.windows(2) {
            pos.extend(0..w[1] - w[0]);
        }
        pos
    }

    /// Block-causal mask: `mask[i * n + j]` is 1 when token i may attend to
    /// token j (same sequence, `j <= i`).
    pub fn attention_mask(&self) -> Vec<u8> {
        let n = self.tokens.len();
        let mut mask = vec![0u8; n * n];

        for w in self.boundaries.windows(2) {
            let (start, end) = (w[0], w[1]);
            for i in start..end {
                mask[i * n + start..=i * n + i].fill(1);
            }
        }

        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipack::BatchPacker;
    use sftpack_core::PackingVersion;

    fn dataset() -> TokenizedDataset {
        TokenizedDataset::from_sequences(vec![vec![10, 20, 30], vec![40, 50], vec![60]])
    }

    /// One batch holding every example in index order.
    fn whole_batch(ds: &TokenizedDataset) -> Batch {
        let lengths = ds.lengths().unwrap();
        let order: Vec<usize> = (0..ds.len()).collect();
        let plan = BatchPacker::new(lengths.total_tokens(), PackingVersion::V1)
            .unwrap()
            .pack(&order, &lengths)
            .unwrap();
        plan.batches()[0].clone()
    }

    #[test]
    fn test_padded_longest() {
        let ds = dataset();
        let batch = whole_batch(&ds);
        let out = PaddedCollator::new(0).collate(&ds, &batch).unwrap();

        assert_eq!(out.batch_size(), 3);
        assert_eq!(out.seq_len, 3);
        assert_eq!(out.input_ids[1], vec![40, 50, 0]);
        assert_eq!(out.labels[1], vec![40, 50, IGNORE_INDEX]);
        assert_eq!(out.attention_mask[2], vec![1, 0, 0]);
    }

    #[test]
    fn test_padded_explicit_labels() {
        let ds = TokenizedDataset::from_examples(vec![
            Example { input_ids: vec![1, 2, 3], labels: Some(vec![IGNORE_INDEX, IGNORE_INDEX, 3]) },
            Example { input_ids: vec![4], labels: None },
        ]);
        let batch = whole_batch(&ds);
        let out = PaddedCollator { pad_token_id: 999, ignore_index: -1 }
            .collate(&ds, &batch)
            .unwrap();
        assert_eq!(out.labels[0], vec![IGNORE_INDEX, IGNORE_INDEX, 3]);
        assert_eq!(out.input_ids[1], vec![4, 999, 999]);
        assert_eq!(out.labels[1], vec![4, -1, -1]);

        let packed = PackedBatch::from_batch(&ds, &batch).unwrap();
        assert_eq!(packed.labels, vec![IGNORE_INDEX, IGNORE_INDEX, 3, 4]);
    }

    #[test]
    fn test_packed_boundaries() {
        let ds = dataset();
        let packed = PackedBatch::from_batch(&ds, &whole_batch(&ds)).unwrap();

        assert_eq!(packed.len(), 6);
        assert_eq!(packed.num_sequences, 3);
        assert_eq!(packed.boundaries, vec![0, 3, 5, 6]);
        assert_eq!(packed.sequence(0), &[10, 20, 30]);
        assert_eq!(packed.sequence(1), &[40, 50]);
        assert_eq!(packed.sequence(2), &[60]);
        assert_eq!(packed.position_ids(), vec![0, 1, 2, 0, 1, 0]);
    }

    #[test]
    fn test_packed_attention_mask() {
        let ds = TokenizedDataset::from_sequences(vec![vec![1, 2, 3], vec![4, 5]]);
        let packed = PackedBatch::from_batch(&ds, &whole_batch(&ds)).unwrap();
        let mask = packed.attention_mask();
        let n = 5;

        // Seq 0: tokens 0,1,2, causal within
        assert_eq!(mask[0 * n + 0], 1);
        assert_eq!(mask[1 * n + 0], 1);
        assert_eq!(mask[2 * n + 1], 1);
        assert_eq!(mask[0 * n + 1], 0);

        // Seq 1: tokens 3,4
        assert_eq!(mask[3 * n + 3], 1);
        assert_eq!(mask[4 * n + 3], 1);

        // Cross-sequence: blocked
        assert_eq!(mask[3 * n + 0], 0);
        assert_eq!(mask[4 * n + 2], 0);
    }

    #[test]
    fn test_out_of_range_index() {
        let big = TokenizedDataset::from_sequences(vec![vec![1], vec![2], vec![3], vec![4]]);
        let batch = whole_batch(&big);
        let small = TokenizedDataset::from_sequences(vec![vec![1]]);
        assert!(PaddedCollator::new(0).collate(&small, &batch).unwrap_err().is_config());
        assert!(PackedBatch::from_batch(&small, &batch).unwrap_err().is_config());
    }
}
