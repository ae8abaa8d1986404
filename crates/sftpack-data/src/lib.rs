//! # sftpack-data
//!
//! Distributed length-aware batch packing for supervised fine-tuning.
//!
//! Provides:
//! - `epoch_permutation`: deterministic per-epoch example order
//! - `BatchPacker`: greedy first-fit packing under a token budget
//! - `ReplicaSharder`: round-robin split of a plan across workers
//! - `SamplerSession`: the per-worker, epoch-aware sampler a training loop drives
//! - `TokenizedDataset`: tokenized examples and their lengths
//! - `PaddedCollator` / `PackedBatch`: index batches to model-ready rows

pub mod permutation;
pub mod multipack;
pub mod sharder;
pub mod sampler;
pub mod dataset;
pub mod collate;

pub use permutation::{epoch_permutation, EpochPermutation};
pub use multipack::{Batch, BatchPacker, PackingPlan};
pub use sharder::{ReplicaBatches, ReplicaSharder};
pub use sampler::SamplerSession;
pub use dataset::{Example, TokenizedDataset};
pub use collate::{PackedBatch, PaddedBatch, PaddedCollator, IGNORE_INDEX};
