use std::collections::BTreeMap;

use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Normal, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::{Validate, ValidationError};

use crate::{
    common::ClientId,
    data::{DataManager, Dataset, TRAIN_SPLIT},
};

/// The name of the local and global evaluation splits.
const TEST_SPLIT: &str = "test";

/// The learning task of the synthetic data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    /// Class indices as targets, suited for `cross_entropy`.
    Classification,
    /// Real valued targets, suited for `mse`.
    Regression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
#[validate(schema(function = "validate_synthetic"))]
/// The arguments of the `synthetic` data manager.
pub struct SyntheticParams {
    /// The learning task.
    pub task: Task,
    /// The number of input features.
    #[validate(range(min = 1))]
    pub num_features: usize,
    /// The number of classes of a classification task.
    #[validate(range(min = 2))]
    pub num_classes: usize,
    /// The smallest number of local samples (train and test) of a client.
    #[validate(range(min = 1))]
    pub min_samples: usize,
    /// The largest number of local samples (train and test) of a client.
    pub max_samples: usize,
    /// The share of the local samples held out for the local `test` split.
    #[validate(range(min = 0.0, max = 0.9))]
    pub local_test_fraction: f64,
    /// The number of samples of the global `test` split.
    #[validate(range(min = 1))]
    pub global_test_samples: usize,
    /// The standard deviation of the label noise.
    #[validate(range(min = 0.0))]
    pub noise: f64,
    /// The standard deviation of the per-client feature offsets. `0` gives iid clients.
    #[validate(range(min = 0.0))]
    pub feature_skew: f64,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            task: Task::Classification,
            num_features: 10,
            num_classes: 3,
            min_samples: 20,
            max_samples: 60,
            local_test_fraction: 0.2,
            global_test_samples: 500,
            noise: 0.1,
            feature_skew: 0.0,
        }
    }
}

fn validate_synthetic(params: &SyntheticParams) -> Result<(), ValidationError> {
    if params.min_samples <= params.max_samples {
        Ok(())
    } else {
        Err(ValidationError::new("min_samples exceeds max_samples"))
    }
}

/// A seeded data manager generating a linear ground truth with Gaussian features.
///
/// Every client holds a `train` and a `test` split of a random size in
/// `min_samples..=max_samples`. The global data consists of a single `test` split drawn from the
/// ground truth without any client skew.
#[derive(Debug, Clone)]
pub struct SyntheticDataManager {
    num_features: usize,
    num_outputs: usize,
    clients: Vec<BTreeMap<String, Dataset>>,
    global: BTreeMap<String, Dataset>,
}

struct GroundTruth {
    task: Task,
    weights: Array2<f64>,
    noise: f64,
}

impl GroundTruth {
    fn generate(&self, rng: &mut ChaCha20Rng, num_samples: usize, offset: &Array1<f64>) -> Dataset {
        let num_features = self.weights.ncols();
        let features = Array2::from_shape_fn((num_samples, num_features), |_| {
            rng.sample::<f64, _>(StandardNormal)
        }) + offset;

        let mut outputs = features.dot(&self.weights.t());
        if self.noise > 0.0 {
            outputs.mapv_inplace(|y| y + self.noise * rng.sample::<f64, _>(StandardNormal));
        }

        let targets = match self.task {
            Task::Regression => outputs.column(0).to_owned(),
            Task::Classification => outputs
                .axis_iter(Axis(0))
                .map(|row| argmax(row.iter()) as f64)
                .collect(),
        };

        Dataset {
            features,
            targets,
        }
    }
}

pub(crate) fn argmax<'a>(values: impl Iterator<Item = &'a f64>) -> usize {
    values
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, max), (i, x)| {
            if *x > max {
                (i, *x)
            } else {
                (best, max)
            }
        })
        .0
}

impl SyntheticDataManager {
    /// Generates the data of `num_clients` clients from `seed`.
    pub fn new(num_clients: usize, params: &SyntheticParams, seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);

        let num_outputs = match params.task {
            Task::Classification => params.num_classes,
            Task::Regression => 1,
        };
        let truth = GroundTruth {
            task: params.task,
            weights: Array2::from_shape_fn((num_outputs, params.num_features), |_| {
                rng.sample::<f64, _>(StandardNormal)
            }),
            noise: params.noise,
        };

        let skew = Normal::new(0.0, params.feature_skew).ok();
        let clients = (0..num_clients)
            .map(|_| {
                let num_samples = rng.gen_range(params.min_samples..=params.max_samples);
                let num_test = (num_samples as f64 * params.local_test_fraction).round() as usize;
                let offset = match &skew {
                    Some(skew) if params.feature_skew > 0.0 => {
                        Array1::from_shape_fn(params.num_features, |_| rng.sample::<f64, _>(skew))
                    }
                    _ => Array1::zeros(params.num_features),
                };

                let mut splits = BTreeMap::new();
                splits.insert(
                    TRAIN_SPLIT.to_string(),
                    truth.generate(&mut rng, num_samples - num_test, &offset),
                );
                splits.insert(
                    TEST_SPLIT.to_string(),
                    truth.generate(&mut rng, num_test, &offset),
                );
                splits
            })
            .collect();

        let mut global = BTreeMap::new();
        let no_offset = Array1::zeros(params.num_features);
        global.insert(
            TEST_SPLIT.to_string(),
            truth.generate(&mut rng, params.global_test_samples, &no_offset),
        );

        let manager = Self {
            num_features: params.num_features,
            num_outputs,
            clients,
            global,
        };
        debug!(
            num_clients,
            total_train_samples = manager.total_train_samples(),
            "generated synthetic data"
        );
        manager
    }
}

impl DataManager for SyntheticDataManager {
    fn num_clients(&self) -> usize {
        self.clients.len()
    }

    fn local_split_names(&self) -> Vec<String> {
        vec![TRAIN_SPLIT.to_string(), TEST_SPLIT.to_string()]
    }

    fn client_split(&self, client_id: ClientId, split: &str) -> Option<&Dataset> {
        self.clients.get(client_id)?.get(split)
    }

    fn global_split_names(&self) -> Vec<String> {
        self.global.keys().cloned().collect()
    }

    fn global_split(&self, split: &str) -> Option<&Dataset> {
        self.global.get(split)
    }

    fn num_features(&self) -> usize {
        self.num_features
    }

    fn num_outputs(&self) -> usize {
        self.num_outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition() {
        let params = SyntheticParams {
            min_samples: 10,
            max_samples: 20,
            ..SyntheticParams::default()
        };
        let data = SyntheticDataManager::new(5, &params, 0);

        assert_eq!(data.num_clients(), 5);
        assert_eq!(data.num_outputs(), 3);
        let mut total = 0;
        for client_id in 0..5 {
            let train = data.client_split(client_id, "train").unwrap();
            let test = data.client_split(client_id, "test").unwrap();
            assert!((10..=20).contains(&(train.len() + test.len())));
            assert_eq!(train.num_features(), 10);
            assert!(train.targets().iter().all(|t| *t >= 0.0 && *t < 3.0));
            total += train.len();
        }
        assert_eq!(data.total_train_samples(), total);
        assert!(data.client_split(5, "train").is_none());
        assert_eq!(data.global_split("test").unwrap().len(), 500);
        assert_eq!(data.global_split_names(), vec!["test".to_string()]);
    }

    #[test]
    fn test_reproducible() {
        let params = SyntheticParams::default();
        let a = SyntheticDataManager::new(3, &params, 7);
        let b = SyntheticDataManager::new(3, &params, 7);
        let c = SyntheticDataManager::new(3, &params, 8);
        assert_eq!(a.client_split(2, "train"), b.client_split(2, "train"));
        assert_ne!(a.global_split("test"), c.global_split("test"));
    }

    #[test]
    fn test_regression() {
        let params = SyntheticParams {
            task: Task::Regression,
            feature_skew: 1.0,
            ..SyntheticParams::default()
        };
        let data = SyntheticDataManager::new(2, &params, 1);
        assert_eq!(data.num_outputs(), 1);
    }

    #[test]
    fn test_validation() {
        let params = SyntheticParams {
            min_samples: 30,
            max_samples: 10,
            ..SyntheticParams::default()
        };
        assert!(params.validate().is_err());

        let params = SyntheticParams {
            num_features: 0,
            ..SyntheticParams::default()
        };
        assert!(params.validate().is_err());
        assert!(SyntheticParams::default().validate().is_ok());
    }
}
