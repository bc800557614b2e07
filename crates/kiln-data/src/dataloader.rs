//! DataLoader: batched iteration over datasets.
//!
//! Wraps any `Dataset` and yields `(input, target)` tensor batches whose
//! leading axis is the batch.

use std::sync::atomic::{AtomicU64, Ordering};

use kiln_core::{KilnError, Result, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// A single sample as flat f32 values.
#[derive(Debug, Clone)]
pub struct Sample {
    pub input: Vec<f32>,
    pub target: Vec<f32>,
}

/// Trait for indexable datasets.
///
/// Every sample of one dataset has the same input and target shape.
pub trait Dataset: Send + Sync {
    /// Total number of samples.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a single sample by index.
    fn get(&self, index: usize) -> Sample;

    /// Per-sample input shape, e.g. `[T]` for a token window.
    fn input_shape(&self) -> &[usize];

    /// Per-sample target shape; empty for a single class id.
    fn target_shape(&self) -> &[usize];
}

/// In-memory dataset split along the first axis of an input and a target tensor.
pub struct TensorDataset {
    inputs: Vec<Vec<f32>>,
    targets: Vec<Vec<f32>>,
    input_shape: Vec<usize>,
    target_shape: Vec<usize>,
}

impl TensorDataset {
    /// `inputs` is `[N, ..]` and `targets` is `[N, ..]`.
    pub fn new(inputs: &Tensor, targets: &Tensor) -> Result<Self> {
        let (in_dims, tgt_dims) = (inputs.dims(), targets.dims());
        if in_dims.is_empty() || tgt_dims.is_empty() || in_dims[0] != tgt_dims[0] {
            return Err(KilnError::ShapeMismatch { expected: in_dims.to_vec(), got: tgt_dims.to_vec() });
        }

        let n = in_dims[0];
        let input_shape = in_dims[1..].to_vec();
        let target_shape = tgt_dims[1..].to_vec();
        let in_len: usize = input_shape.iter().product();
        let tgt_len: usize = target_shape.iter().product();

        let in_data = inputs.as_slice();
        let tgt_data = targets.as_slice();
        let inputs = (0..n).map(|i| in_data[i * in_len..(i + 1) * in_len].to_vec()).collect();
        let targets = (0..n).map(|i| tgt_data[i * tgt_len..(i + 1) * tgt_len].to_vec()).collect();

        Ok(Self { inputs, targets, input_shape, target_shape })
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.inputs.len()
    }

    fn get(&self, index: usize) -> Sample {
        Sample { input: self.inputs[index].clone(), target: self.targets[index].clone() }
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn target_shape(&self) -> &[usize] {
        &self.target_shape
    }
}

/// A batch of `(input, target)` tensors.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, ..input_shape]`
    pub input: Tensor,
    /// `[batch, ..target_shape]`
    pub target: Tensor,
    /// Number of samples in this batch.
    pub size: usize,
}

/// Batched iteration over a `Dataset`.
///
/// # Example
/// ```
/// use kiln_core::Tensor;
/// use kiln_data::{DataLoader, TensorDataset};
///
/// let x = Tensor::zeros(&[10, 4]);
/// let y = Tensor::zeros(&[10]);
/// let ds = TensorDataset::new(&x, &y).unwrap();
/// let loader = DataLoader::new(Box::new(ds), 4, true, false, Some(7)).unwrap();
///
/// let sizes: Vec<usize> = loader.iter().map(|b| b.size).collect();
/// assert_eq!(sizes, vec![4, 4, 2]);
/// ```
pub struct DataLoader {
    dataset: Box<dyn Dataset>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: Option<u64>,
    epoch_counter: AtomicU64,
}

impl DataLoader {
    /// - `batch_size`: samples per batch, must be non-zero
    /// - `shuffle`: reshuffle indices on every `iter()` call
    /// - `drop_last`: drop the trailing incomplete batch
    /// - `seed`: reproducible shuffling; the epoch number is mixed in
    pub fn new(
        dataset: Box<dyn Dataset>,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        seed: Option<u64>,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(KilnError::InvalidConfig("batch_size must be > 0".into()));
        }
        Ok(Self { dataset, batch_size, shuffle, drop_last, seed, epoch_counter: AtomicU64::new(0) })
    }

    /// Number of batches per epoch.
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &dyn Dataset {
        self.dataset.as_ref()
    }

    /// Number of shuffled passes started so far.
    pub fn epoch(&self) -> u64 {
        self.epoch_counter.load(Ordering::Relaxed)
    }

    /// Iterator over the batches of one epoch.
    pub fn iter(&self) -> DataLoaderIter<'_> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();

        if self.shuffle {
            let epoch = self.epoch_counter.fetch_add(1, Ordering::Relaxed);
            match self.seed {
                Some(seed) => {
                    let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(epoch));
                    indices.shuffle(&mut rng);
                }
                None => indices.shuffle(&mut rand::thread_rng()),
            }
        }

        DataLoaderIter { loader: self, indices, pos: 0 }
    }
}

impl<'a> IntoIterator for &'a DataLoader {
    type Item = Batch;
    type IntoIter = DataLoaderIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over DataLoader batches.
pub struct DataLoaderIter<'a> {
    loader: &'a DataLoader,
    indices: Vec<usize>,
    pos: usize,
}

impl Iterator for DataLoaderIter<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.indices.len();
        if self.pos >= n {
            return None;
        }

        let end = (self.pos + self.loader.batch_size).min(n);
        let batch_indices = &self.indices[self.pos..end];
        let size = batch_indices.len();
        if self.loader.drop_last && size < self.loader.batch_size {
            return None;
        }

        let dataset = self.loader.dataset.as_ref();
        let mut input_data = Vec::new();
        let mut target_data = Vec::new();
        for &idx in batch_indices {
            let sample = dataset.get(idx);
            input_data.extend_from_slice(&sample.input);
            target_data.extend_from_slice(&sample.target);
        }

        let mut input_dims = vec![size];
        input_dims.extend_from_slice(dataset.input_shape());
        let mut target_dims = vec![size];
        target_dims.extend_from_slice(dataset.target_shape());

        self.pos = end;

        // Every sample matches the declared shapes, so these cannot fail.
        let input = Tensor::from_vec(input_data, &input_dims).ok()?;
        let target = Tensor::from_vec(target_data, &target_dims).ok()?;
        Some(Batch { input, target, size })
    }
}
