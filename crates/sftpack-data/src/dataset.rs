//! TokenizedDataset: tokenized instruction examples and their lengths.
//!
//! Reads JSONL where each line carries an `input_ids` array (and optionally
//! `labels`), the shape a supervised fine-tuning tokenizer pass emits. The
//! packer only needs `lengths()`; the collator needs the token ids.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;
use sftpack_core::{LengthTable, PackError, Result};

#[derive(Debug, Deserialize)]
struct TokenizedRecord {
    input_ids: Vec<u32>,
    #[serde(default)]
    labels: Option<Vec<i64>>,
}

/// One tokenized example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub input_ids: Vec<u32>,
    /// Per-token labels; `None` means train on every token.
    pub labels: Option<Vec<i64>>,
}

/// In-memory collection of tokenized examples in dataset order.
#[derive(Debug, Clone, Default)]
pub struct TokenizedDataset {
    examples: Vec<Example>,
}

impl TokenizedDataset {
    /// Load a JSONL file of `{"input_ids": [...], "labels": [...]}` records.
    ///
    /// Blank lines are skipped. Parse failures report the 1-based line number.
    pub fn from_jsonl(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            PackError::StorageError(format!("failed to open {}: {e}", path.display()))
        })?;
        let reader = BufReader::new(file);

        let mut examples = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| {
                PackError::StorageError(format!("failed to read {}: {e}", path.display()))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record: TokenizedRecord = serde_json::from_str(&line).map_err(|e| {
                PackError::StorageError(format!(
                    "failed to parse record at line {} in {}: {e}",
                    line_num + 1,
                    path.display()
                ))
            })?;
            examples.push(Example { input_ids: record.input_ids, labels: record.labels });
        }

        tracing::info!(
            examples = examples.len(),
            path = %path.display(),
            "loaded tokenized dataset"
        );
        Ok(Self { examples })
    }

    /// Build from raw token sequences with no explicit labels.
    pub fn from_sequences(sequences: Vec<Vec<u32>>) -> Self {
        let examples = sequences
            .into_iter()
            .map(|input_ids| Example { input_ids, labels: None })
            .collect();
        Self { examples }
    }

    pub fn from_examples(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Example at `index`.
    pub fn get(&self, index: usize) -> Option<&Example> {
        self.examples.get(index)
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    /// Token length of every example, in dataset order.
    ///
    /// Fails with `ConfigError` if any example has no tokens.
    pub fn lengths(&self) -> Result<LengthTable> {
        LengthTable::new(self.examples.iter().map(|e| e.input_ids.len()).collect())
    }
}
