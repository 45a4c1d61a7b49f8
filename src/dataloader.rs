//! Mini-batching of in-memory datasets

use std::collections::HashSet;

use rand::{Rng, SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::values::Value;

#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error("Inputs have differing widths {input_dims:?}")]
    InputDimensionMismatch { input_dims: HashSet<usize> },
    #[error("{label_len} labels for {data_len} inputs")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Batch size must be positive")]
    ZeroBatchSize,
}

/// Inputs of a batch as fresh graph leaves, and the class index of each input
pub type Batch = (Vec<Vec<Value>>, Vec<usize>);

/// Splits a dataset into batches once per epoch, in a new random order when `shuffle` is set,
/// like `torch.utils.data.DataLoader`
pub struct DataLoader {
    data: Vec<Vec<f32>>,
    // zero-based class indices
    labels: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
}

impl DataLoader {
    pub fn new(
        data: Vec<Vec<f32>>,
        labels: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if labels.len() != data.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: data.len(),
            });
        }
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        let input_dims = data.iter().map(Vec::len).collect::<HashSet<_>>();
        if input_dims.len() > 1 {
            return Err(DataLoaderError::InputDimensionMismatch { input_dims });
        }
        Ok(Self {
            data,
            labels,
            batch_size,
            shuffle,
        })
    }

    /// Number of batches per epoch, the last one may be smaller than `batch_size`
    pub fn len(&self) -> usize {
        self.data.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn n_samples(&self) -> usize {
        self.data.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Width of every input vector, `None` for an empty dataset
    pub fn input_size(&self) -> Option<usize> {
        self.data.first().map(|d| d.len())
    }

    /// Iterates over one epoch, shuffled with a fixed seed if shuffling is enabled
    pub fn seeded_iter(&self, seed: u64) -> DataLoaderIterator<'_> {
        self.iter_with(&mut Pcg64Mcg::seed_from_u64(seed))
    }

    /// Iterates over one epoch, shuffled if shuffling is enabled
    pub fn iter(&self) -> DataLoaderIterator<'_> {
        self.iter_with(&mut rand::rng())
    }

    fn iter_with<R: Rng + ?Sized>(&self, rng: &mut R) -> DataLoaderIterator<'_> {
        let mut order = (0..self.data.len()).collect::<Vec<_>>();
        if self.shuffle {
            order.shuffle(rng);
        }
        DataLoaderIterator {
            loader: self,
            order,
            cursor: 0,
        }
    }
}

/// One epoch of batches
pub struct DataLoaderIterator<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    // position in `order` of the next batch
    cursor: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.order.get(self.cursor..).filter(|r| !r.is_empty())?;
        let batch = &remaining[..remaining.len().min(self.loader.batch_size)];
        self.cursor += batch.len();

        let inputs = batch
            .iter()
            .map(|&i| self.loader.data[i].iter().copied().map(Value::new).collect())
            .collect();
        let labels = batch.iter().map(|&i| self.loader.labels[i]).collect();
        Some((inputs, labels))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.order.len() - self.cursor).div_ceil(self.loader.batch_size);
        (n, Some(n))
    }
}

impl ExactSizeIterator for DataLoaderIterator<'_> {}
