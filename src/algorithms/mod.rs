//! Federated learning algorithms.
//!
//! An algorithm plugs into the round lifecycle of the [`StateMachine`] through the [`Hooks`]:
//!
//! 1. [`Hooks::init()`] writes the initial server and client state once before the first round.
//! 2. [`Hooks::send_to_server()`] runs on behalf of every selected client: it trains the client
//!    model, updates the client-local state and returns a [`ClientMessage`].
//! 3. [`Hooks::receive_from_client()`] weights a message and feeds it into the round's
//!    [`Aggregator`].
//! 4. [`Hooks::optimize()`] consumes the aggregated parameters, updates the global state and
//!    returns the remaining aggregated fields (the local scores).
//! 5. [`Hooks::deploy()`] hands out the servable parameter snapshots.
//!
//! FedNova and FedProx are FedAvg with a different client weight or an additional gradient term,
//! they wrap a [`FedAvg`] and delegate everything else to it.
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

mod fedavg;
mod feddyn;
mod fednova;
mod fedprox;

use std::{collections::BTreeMap, str::FromStr};

use derive_more::{Display, From};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use self::{
    fedavg::{FedAvg, ServerOptimizer},
    feddyn::{FedDyn, FedDynParams},
    fednova::FedNova,
    fedprox::{FedProx, FedProxParams},
};
use crate::{
    aggregation::{AggregationError, Aggregator},
    common::{ClientId, Params, Value, ValueKindError},
    data::{DataManager, TRAIN_SPLIT},
    model::{Model, ModelError},
    optim::SizeMismatch,
    scores::{local_score_key, ScoreHooks},
    storage::{ClientView, Store, StoreError},
    training::{predict, GradTransform, LocalTrainer, TrainingError},
};

/// The aggregation field of the trained client parameters.
pub const LOCAL_PARAMS: &str = "local_params";

/// Errors of the algorithm hooks.
#[derive(Debug, Error)]
pub enum AlgorithmError {
    #[error("store access failed: {0}")]
    Store(#[from] StoreError),

    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("local training failed: {0}")]
    Training(#[from] TrainingError),

    #[error("model failed: {0}")]
    Model(#[from] ModelError),

    #[error("server optimizer failed: {0}")]
    Optimizer(#[from] SizeMismatch),

    #[error("unexpected aggregate: {0}")]
    ValueKind(#[from] ValueKindError),

    #[error("client {client_id} has no `{split}` split")]
    MissingSplit { client_id: ClientId, split: String },
}

/// The name of an algorithm.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmName {
    #[display(fmt = "fedavg")]
    FedAvg,
    #[display(fmt = "fednova")]
    FedNova,
    #[display(fmt = "fedprox")]
    FedProx,
    #[display(fmt = "feddyn")]
    FedDyn,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown algorithm `{0}` (expected `fedavg`, `fednova`, `fedprox` or `feddyn`)")]
pub struct ParseAlgorithmNameError(String);

impl FromStr for AlgorithmName {
    type Err = ParseAlgorithmNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fedavg" => Ok(AlgorithmName::FedAvg),
            "fednova" => Ok(AlgorithmName::FedNova),
            "fedprox" => Ok(AlgorithmName::FedProx),
            "feddyn" => Ok(AlgorithmName::FedDyn),
            _ => Err(ParseAlgorithmNameError(s.to_string())),
        }
    }
}

/// A local score of a client, reported together with its weight (the size of the split).
#[derive(Debug, Clone, PartialEq)]
pub struct LocalScore {
    pub key: String,
    pub value: f64,
    pub weight: f64,
}

/// The message a client sends to the server at the end of its local training.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage {
    /// The trained parameters.
    pub local_params: Params,
    /// The number of samples seen during the local training.
    pub num_samples: usize,
    /// The number of local optimization steps.
    pub num_steps: usize,
    /// The local scores of the trained model.
    pub scores: Vec<LocalScore>,
}

/// Everything a client task needs for its local round.
#[derive(Debug)]
pub struct ClientContext<'a> {
    /// The client's view of the store.
    pub view: ClientView<'a>,
    /// A snapshot of the global parameters of this round.
    pub cloud_params: &'a Params,
    pub data: &'a dyn DataManager,
    /// A fresh model instance for this client.
    pub model: Box<dyn Model>,
    pub trainer: LocalTrainer<'a>,
    pub score_hooks: &'a ScoreHooks,
    pub test_batch_size: usize,
    pub rng: ChaCha20Rng,
}

impl<'a> ClientContext<'a> {
    pub fn client_id(&self) -> ClientId {
        self.view.client_id()
    }

    /// Gets the number of local training samples of the client.
    pub fn num_train_samples(&self) -> usize {
        self.data
            .client_split(self.client_id(), TRAIN_SPLIT)
            .map_or(0, |split| split.len())
    }
}

/// The extension points of a federated learning algorithm.
pub trait Hooks {
    /// Writes the initial state, starting from the global parameters `init_params`.
    fn init(&mut self, store: &mut Store, init_params: &Params) -> Result<(), AlgorithmError>;

    /// Trains the client model and returns the client's message.
    fn send_to_server(&self, ctx: &mut ClientContext<'_>) -> Result<ClientMessage, AlgorithmError>;

    /// Weights the message and accumulates it.
    fn receive_from_client(
        &self,
        client_id: ClientId,
        message: ClientMessage,
        aggregator: &Aggregator,
    ) -> Result<(), AlgorithmError>;

    /// Updates the global state from the aggregated messages and returns all remaining
    /// aggregated fields.
    fn optimize(
        &mut self,
        store: &mut Store,
        aggregator: &Aggregator,
    ) -> Result<BTreeMap<String, Value>, AlgorithmError>;

    /// Gets the servable parameter snapshots by name.
    fn deploy(&self, store: &Store) -> Result<BTreeMap<String, Params>, AlgorithmError>;
}

/// A federated learning algorithm.
#[derive(Debug, From)]
pub enum Algorithm {
    FedAvg(FedAvg),
    FedNova(FedNova),
    FedProx(FedProx),
    FedDyn(FedDyn),
}

impl Algorithm {
    pub fn name(&self) -> AlgorithmName {
        match self {
            Algorithm::FedAvg(_) => AlgorithmName::FedAvg,
            Algorithm::FedNova(_) => AlgorithmName::FedNova,
            Algorithm::FedProx(_) => AlgorithmName::FedProx,
            Algorithm::FedDyn(_) => AlgorithmName::FedDyn,
        }
    }

    fn hooks(&self) -> &dyn Hooks {
        match self {
            Algorithm::FedAvg(algorithm) => algorithm,
            Algorithm::FedNova(algorithm) => algorithm,
            Algorithm::FedProx(algorithm) => algorithm,
            Algorithm::FedDyn(algorithm) => algorithm,
        }
    }

    fn hooks_mut(&mut self) -> &mut dyn Hooks {
        match self {
            Algorithm::FedAvg(algorithm) => algorithm,
            Algorithm::FedNova(algorithm) => algorithm,
            Algorithm::FedProx(algorithm) => algorithm,
            Algorithm::FedDyn(algorithm) => algorithm,
        }
    }
}

impl Hooks for Algorithm {
    fn init(&mut self, store: &mut Store, init_params: &Params) -> Result<(), AlgorithmError> {
        self.hooks_mut().init(store, init_params)
    }

    fn send_to_server(&self, ctx: &mut ClientContext<'_>) -> Result<ClientMessage, AlgorithmError> {
        self.hooks().send_to_server(ctx)
    }

    fn receive_from_client(
        &self,
        client_id: ClientId,
        message: ClientMessage,
        aggregator: &Aggregator,
    ) -> Result<(), AlgorithmError> {
        self.hooks().receive_from_client(client_id, message, aggregator)
    }

    fn optimize(
        &mut self,
        store: &mut Store,
        aggregator: &Aggregator,
    ) -> Result<BTreeMap<String, Value>, AlgorithmError> {
        self.hooks_mut().optimize(store, aggregator)
    }

    fn deploy(&self, store: &Store) -> Result<BTreeMap<String, Params>, AlgorithmError> {
        self.hooks().deploy(store)
    }
}

/// Trains the client model starting from the global parameters and evaluates the local scores.
pub(crate) fn local_update(
    ctx: &mut ClientContext<'_>,
    transform: &dyn GradTransform,
) -> Result<ClientMessage, AlgorithmError> {
    let client_id = ctx.client_id();
    let data = ctx.data;
    let train = data
        .client_split(client_id, TRAIN_SPLIT)
        .ok_or_else(|| AlgorithmError::MissingSplit {
            client_id,
            split: TRAIN_SPLIT.to_string(),
        })?;

    ctx.model.set_parameters(ctx.cloud_params)?;
    let outcome = ctx
        .trainer
        .train(ctx.model.as_mut(), train, transform, &mut ctx.rng)?;
    debug!(
        client_id,
        num_steps = outcome.num_steps,
        mean_loss = ?outcome.mean_loss,
        "finished local training"
    );

    let model = ctx.model.as_ref();
    let scores = ctx
        .score_hooks
        .local_scores()
        .filter_map(|hook| {
            let split = data
                .client_split(client_id, &hook.split)
                .filter(|split| !split.is_empty())?;
            let outputs = predict(model, split, ctx.test_batch_size);
            Some(LocalScore {
                key: local_score_key(&hook.split, &hook.name),
                value: (hook.score)(outputs.view(), split.targets()),
                weight: split.len() as f64,
            })
        })
        .collect();

    Ok(ClientMessage {
        local_params: model.parameters(),
        num_samples: outcome.num_samples,
        num_steps: outcome.num_steps,
        scores,
    })
}

/// Accumulates the parameters of a message with `weight` and its scores with their own weights.
pub(crate) fn aggregate_message(
    client_id: ClientId,
    message: ClientMessage,
    weight: f64,
    aggregator: &Aggregator,
) -> Result<(), AggregationError> {
    let ClientMessage {
        local_params,
        scores,
        ..
    } = message;
    aggregator.accumulate(client_id, LOCAL_PARAMS, &Value::Vector(local_params), weight)?;
    for score in scores {
        aggregator.accumulate(client_id, &score.key, &Value::Scalar(score.value), score.weight)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use ndarray::{ArrayView1, ArrayView2};
    use rand::SeedableRng;

    use super::*;
    use crate::{
        data::{SyntheticDataManager, SyntheticParams},
        model::{CrossEntropy, Linear},
        optim::{Optimizer, Sgd},
        storage::{keys, Accessor, Scope},
        training::TrainingConfig,
    };

    pub fn data(num_clients: usize) -> SyntheticDataManager {
        let params = SyntheticParams {
            num_features: 4,
            num_classes: 2,
            min_samples: 10,
            max_samples: 20,
            global_test_samples: 50,
            ..SyntheticParams::default()
        };
        SyntheticDataManager::new(num_clients, &params, 0)
    }

    /// A store as the initializer leaves it before the algorithm's own initialization.
    pub fn store(data: &SyntheticDataManager) -> Store {
        let num_clients = data.num_clients();
        let total = data.total_train_samples();
        let mut store = Store::new(num_clients);
        store
            .write(Accessor::Server, Scope::Shared, keys::NUM_CLIENTS, num_clients)
            .unwrap();
        store
            .write(Accessor::Server, Scope::Shared, keys::TOTAL_TRAIN_SAMPLES, total)
            .unwrap();
        store
            .write(
                Accessor::Server,
                Scope::Shared,
                keys::AVERAGE_SAMPLE,
                total as f64 / num_clients as f64,
            )
            .unwrap();
        store
    }

    pub fn server_sgd(lr: f64) -> ServerOptimizer {
        ServerOptimizer::new(Box::new(Sgd::new(lr, 0.0, 0.0)), None)
    }

    pub fn hooks() -> ScoreHooks {
        let mut hooks = ScoreHooks::new();
        hooks.hook_local_score(
            "test",
            "constant",
            Arc::new(|_: ArrayView2<f64>, _: ArrayView1<f64>| 0.5),
        );
        hooks
    }

    /// Runs one round of `algorithm` over `clients` and returns the remaining aggregates.
    pub fn run_round(
        algorithm: &mut impl Hooks,
        store: &mut Store,
        data: &SyntheticDataManager,
        clients: &[ClientId],
        epochs: usize,
    ) -> BTreeMap<String, Value> {
        let cloud_params = store
            .read_vector(Accessor::Server, Scope::Server, keys::CLOUD_PARAMS)
            .unwrap()
            .clone();
        let score_hooks = hooks();
        let template = Linear::new(data.num_features(), data.num_outputs());

        let messages: Vec<(ClientId, ClientMessage)> = store
            .client_views(clients)
            .unwrap()
            .into_iter()
            .map(|view| {
                let client_id = view.client_id();
                let mut ctx = ClientContext {
                    view,
                    cloud_params: &cloud_params,
                    data,
                    model: template.boxed_clone(),
                    trainer: LocalTrainer {
                        client_id,
                        loss: &CrossEntropy,
                        optimizer: Sgd::new(0.1, 0.0, 0.0).boxed_clone(),
                        scheduler: None,
                        config: TrainingConfig {
                            epochs,
                            batch_size: 4,
                        },
                    },
                    score_hooks: &score_hooks,
                    test_batch_size: 8,
                    rng: ChaCha20Rng::seed_from_u64(client_id as u64),
                };
                (client_id, algorithm.send_to_server(&mut ctx).unwrap())
            })
            .collect();

        let aggregator = Aggregator::new();
        for (client_id, message) in messages {
            algorithm
                .receive_from_client(client_id, message, &aggregator)
                .unwrap();
        }
        algorithm.optimize(store, &aggregator).unwrap()
    }

    #[test]
    fn test_algorithm_dispatch() {
        let data = data(3);
        let mut store = store(&data);
        let mut algorithm = Algorithm::from(FedAvg::new(server_sgd(1.0)));
        assert_eq!(algorithm.name(), AlgorithmName::FedAvg);
        assert_eq!(algorithm.name().to_string(), "fedavg");
        assert_eq!("fedavg".parse(), Ok(AlgorithmName::FedAvg));
        assert!("scaffold".parse::<AlgorithmName>().is_err());

        algorithm
            .init(&mut store, &Params::zeros(10))
            .unwrap();
        let scores = run_round(&mut algorithm, &mut store, &data, &[0, 2], 1);
        assert_eq!(scores["clients.test.constant"], Value::Scalar(0.5));
        assert!(algorithm.deploy(&store).unwrap().contains_key("cloud"));
    }
}
