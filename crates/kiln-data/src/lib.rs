//! # kiln-data
//!
//! Batched iteration over already-tokenized data.
//!
//! Provides:
//! - `Dataset`: indexable source of `(input, target)` samples
//! - `TensorDataset`: in-memory samples split from a pair of tensors
//! - `SequenceDataset`: next-token windows cut from one token stream
//! - `DataLoader`: shuffled, batched iteration yielding `Batch` tensors

pub mod dataloader;
pub mod sequence;

pub use dataloader::{Batch, DataLoader, DataLoaderIter, Dataset, Sample, TensorDataset};
pub use sequence::SequenceDataset;
