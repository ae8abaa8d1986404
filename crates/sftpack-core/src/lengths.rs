//! LengthTable: per-example token lengths in dataset order.

use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::{PackError, Result};

/// Token length of every example in a dataset.
///
/// Built once from the tokenization layer and never mutated. Every length is
/// at least 1; the packer only ever sees indices and these lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthTable {
    lengths: Vec<usize>,
}

impl LengthTable {
    /// Build a table from per-example lengths.
    ///
    /// Fails with `ConfigError` if any length is zero.
    pub fn new(lengths: Vec<usize>) -> Result<Self> {
        if let Some(index) = lengths.iter().position(|&l| l == 0) {
            return Err(PackError::ConfigError(format!(
                "example {index} has non-positive length 0"
            )));
        }
        Ok(Self { lengths })
    }

    /// Build a table from signed lengths, rejecting anything below 1.
    pub fn try_from_i64(lengths: &[i64]) -> Result<Self> {
        let mut out = Vec::with_capacity(lengths.len());
        for (index, &l) in lengths.iter().enumerate() {
            if l <= 0 {
                return Err(PackError::ConfigError(format!(
                    "example {index} has non-positive length {l}"
                )));
            }
            let len = usize::try_from(l).map_err(|_| {
                PackError::ConfigError(format!(
                    "example {index} has length {l}, which does not fit in usize"
                ))
            })?;
            out.push(len);
        }
        Ok(Self { lengths: out })
    }

    /// Read a plain text file with one integer length per line.
    ///
    /// Blank lines are skipped.
    pub fn read_lengths_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            PackError::StorageError(format!("failed to open {}: {e}", path.display()))
        })?;
        let reader = BufReader::new(file);

        let mut lengths = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| {
                PackError::StorageError(format!("failed to read {}: {e}", path.display()))
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: i64 = trimmed.parse().map_err(|e| {
                PackError::StorageError(format!(
                    "invalid length {trimmed:?} at line {} in {}: {e}",
                    line_num + 1,
                    path.display()
                ))
            })?;
            lengths.push(value);
        }

        Self::try_from_i64(&lengths)
    }

    /// Length of example `index`.
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn get(&self, index: usize) -> usize {
        self.lengths[index]
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    /// Whether the table holds no examples.
    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Sum of all example lengths.
    pub fn total_tokens(&self) -> usize {
        self.lengths.iter().sum()
    }

    /// Longest example, or 0 for an empty table.
    pub fn max_length(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0)
    }

    /// Lengths in dataset order.
    pub fn as_slice(&self) -> &[usize] {
        &self.lengths
    }

    /// Iterate lengths in dataset order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.lengths.iter().copied()
    }
}
