//! # sftpack-core
//!
//! Core types shared by every sftpack crate.
//!
//! Provides:
//! - `PackerConfig`: immutable packing configuration (budget, replicas, seed)
//! - `PackingVersion`: pinned algorithm tag so every worker packs identically
//! - `LengthTable`: per-example token lengths, validated once
//! - `PackError`: the error taxonomy for configuration and data failures

pub mod config;
pub mod error;
pub mod lengths;

pub use config::{PackerConfig, PackingVersion};
pub use error::PackError;
pub use lengths::LengthTable;

pub type Result<T> = std::result::Result<T, PackError>;
