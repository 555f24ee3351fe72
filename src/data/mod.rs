//! Datasets and data managers.
//!
//! A [`DataManager`] owns the data of a simulation: the local splits of every client (at least a
//! `train` split) and the global splits used to evaluate the deployed models.

mod synthetic;

use std::fmt;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

pub(crate) use self::synthetic::argmax;
pub use self::synthetic::{SyntheticDataManager, SyntheticParams, Task};
use crate::common::ClientId;

/// The name of the local split the clients train on.
pub const TRAIN_SPLIT: &str = "train";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{features} feature rows but {targets} targets")]
/// Error returned when the features and targets of a dataset differ in length.
pub struct DatasetLengthMismatch {
    pub features: usize,
    pub targets: usize,
}

/// An in-memory supervised dataset with one feature row and one target per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    features: Array2<f64>,
    targets: Array1<f64>,
}

impl Dataset {
    /// Creates a new dataset.
    ///
    /// # Errors
    /// Fails if the number of feature rows and targets differ.
    pub fn new(features: Array2<f64>, targets: Array1<f64>) -> Result<Self, DatasetLengthMismatch> {
        if features.nrows() != targets.len() {
            return Err(DatasetLengthMismatch {
                features: features.nrows(),
                targets: targets.len(),
            });
        }
        Ok(Self { features, targets })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn features(&self) -> ArrayView2<f64> {
        self.features.view()
    }

    pub fn targets(&self) -> ArrayView1<f64> {
        self.targets.view()
    }

    /// Gathers the samples at `indices` into a batch.
    pub fn select(&self, indices: &[usize]) -> (Array2<f64>, Array1<f64>) {
        (
            self.features.select(Axis(0), indices),
            self.targets.select(Axis(0), indices),
        )
    }

    /// Iterates over consecutive batches of at most `batch_size` samples.
    pub fn batches(
        &self,
        batch_size: usize,
    ) -> impl Iterator<Item = (ArrayView2<'_, f64>, ArrayView1<'_, f64>)> + '_ {
        let batch_size = batch_size.max(1);
        self.features
            .axis_chunks_iter(Axis(0), batch_size)
            .zip(self.targets.axis_chunks_iter(Axis(0), batch_size))
    }
}

/// The source of the client and global data of a simulation.
pub trait DataManager: fmt::Debug + Send + Sync {
    /// Gets the number of clients the data is partitioned for.
    fn num_clients(&self) -> usize;

    /// Gets the names of the local splits every client holds.
    fn local_split_names(&self) -> Vec<String>;

    /// Gets the local `split` of a client.
    fn client_split(&self, client_id: ClientId, split: &str) -> Option<&Dataset>;

    /// Gets the names of the global splits.
    fn global_split_names(&self) -> Vec<String>;

    /// Gets a global split.
    fn global_split(&self, split: &str) -> Option<&Dataset>;

    /// Gets the number of input features per sample.
    fn num_features(&self) -> usize;

    /// Gets the number of model outputs the targets require.
    fn num_outputs(&self) -> usize;

    /// Gets the total number of training samples over all clients.
    fn total_train_samples(&self) -> usize {
        (0..self.num_clients())
            .filter_map(|client_id| self.client_split(client_id, TRAIN_SPLIT))
            .map(Dataset::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_dataset_length_mismatch() {
        assert_eq!(
            Dataset::new(array![[1.0], [2.0]], array![0.0]),
            Err(DatasetLengthMismatch {
                features: 2,
                targets: 1
            })
        );
    }

    #[test]
    fn test_batches() {
        let data = Dataset::new(array![[1.0], [2.0], [3.0]], array![0.0, 1.0, 0.0]).unwrap();
        let sizes: Vec<usize> = data.batches(2).map(|(x, _)| x.nrows()).collect();
        assert_eq!(sizes, vec![2, 1]);

        let (x, y) = data.select(&[2, 0]);
        assert_eq!(x, array![[3.0], [1.0]]);
        assert_eq!(y, array![0.0, 0.0]);
    }
}
