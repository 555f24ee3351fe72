//! The registry of named components.
//!
//! Every configurable component (algorithms, models, optimizers, learning rate schedulers,
//! losses, score functions and data managers) is built by name from a table of arguments. A
//! factory deserializes the table into its typed parameters, validates them and constructs the
//! component.
//!
//! ```toml
//! [optimizer]
//! name = "sgd"
//!
//! [optimizer.args]
//! lr = 1.0
//! momentum = 0.9
//! ```

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

use crate::{
    algorithms::{Algorithm, FedAvg, FedDyn, FedNova, FedProx, ServerOptimizer},
    data::{DataManager, SyntheticDataManager, SyntheticParams},
    model::{CrossEntropy, Linear, Loss, Model, Mse},
    optim::{Adam, ConstantLr, LrScheduler, Optimizer, Sgd, StepLr},
    scores::{self, ScoreFn},
};

/// The arguments of a component by name.
pub type Args = BTreeMap<String, serde_json::Value>;

/// The base parameters of a run. They are set by the federation settings and can't be overridden
/// by the arguments of a component.
pub const RESERVED_PARAMETERS: &[&str] = &[
    "num_clients",
    "sample_scheme",
    "sample_rate",
    "epochs",
    "batch_size",
    "test_batch_size",
    "seed",
    "device",
    "loss_fn",
];

/// Errors of the configuration of a run.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unknown {kind} `{name}`")]
    UnknownName { kind: &'static str, name: String },

    #[error("unknown argument `{argument}` of the {kind} `{name}`")]
    UnknownArgument {
        kind: &'static str,
        name: String,
        argument: String,
    },

    #[error("the {kind} `{name}` can't override the base parameter `{argument}`")]
    ReservedParameter {
        kind: &'static str,
        name: String,
        argument: String,
    },

    #[error("invalid arguments of the {kind} `{name}`: {reason}")]
    InvalidArguments {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("incompatible configuration: {0}")]
    Incompatible(String),
}

/// The arguments handed to a factory.
#[derive(Debug, Clone, Copy)]
pub struct Arguments<'a> {
    kind: &'static str,
    name: &'a str,
    args: &'a Args,
}

impl<'a> Arguments<'a> {
    /// Parses the arguments into `P` and validates them.
    ///
    /// Missing arguments take their default value. The known arguments are the fields of the
    /// serialized default.
    pub fn parse<P>(&self) -> Result<P, ConfigurationError>
    where
        P: Default + Serialize + DeserializeOwned + Validate,
    {
        let defaults = serde_json::to_value(P::default()).map_err(|err| self.invalid(err))?;
        let known = match defaults {
            serde_json::Value::Object(fields) => fields,
            _ => serde_json::Map::new(),
        };
        self.check_known(|argument| known.contains_key(argument))?;

        let table = self
            .args
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let params: P =
            serde_json::from_value(serde_json::Value::Object(table)).map_err(|err| self.invalid(err))?;
        params.validate().map_err(|err| self.invalid(err))?;
        Ok(params)
    }

    /// Checks that no argument is given.
    pub fn none(&self) -> Result<(), ConfigurationError> {
        self.check_known(|_| false)
    }

    fn check_known(&self, is_known: impl Fn(&str) -> bool) -> Result<(), ConfigurationError> {
        match self.args.keys().find(|argument| !is_known(argument.as_str())) {
            Some(argument) => Err(ConfigurationError::UnknownArgument {
                kind: self.kind,
                name: self.name.to_string(),
                argument: argument.clone(),
            }),
            None => Ok(()),
        }
    }

    fn invalid(&self, reason: impl fmt::Display) -> ConfigurationError {
        ConfigurationError::InvalidArguments {
            kind: self.kind,
            name: self.name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Builds a `T` from a context `C` and the arguments.
pub type Factory<C, T> = fn(C, Arguments<'_>) -> Result<T, ConfigurationError>;

/// The factories of one kind of component by name.
pub struct Factories<C, T> {
    kind: &'static str,
    factories: BTreeMap<String, Factory<C, T>>,
}

impl<C, T> fmt::Debug for Factories<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factories")
            .field("kind", &self.kind)
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<C, T> Factories<C, T> {
    /// Creates an empty set of factories for components of the given kind.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    /// Registers a factory, replacing and returning the factory previously registered under the
    /// same name.
    pub fn register(&mut self, name: &str, factory: Factory<C, T>) -> Option<Factory<C, T>> {
        self.factories.insert(name.to_string(), factory)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Builds the component registered as `name`.
    ///
    /// # Errors
    /// Fails if the name is unknown, if the arguments override a base parameter or if the
    /// factory rejects them.
    pub fn build(&self, name: &str, context: C, args: &Args) -> Result<T, ConfigurationError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownName {
                kind: self.kind,
                name: name.to_string(),
            })?;
        if let Some(argument) = args
            .keys()
            .find(|argument| RESERVED_PARAMETERS.contains(&argument.as_str()))
        {
            return Err(ConfigurationError::ReservedParameter {
                kind: self.kind,
                name: name.to_string(),
                argument: argument.clone(),
            });
        }
        factory(
            context,
            Arguments {
                kind: self.kind,
                name,
                args,
            },
        )
    }
}

/// The dimensions a model is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelShape {
    pub num_features: usize,
    pub num_outputs: usize,
}

/// The base parameters a data manager is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSource {
    pub num_clients: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
/// The arguments of the `sgd` optimizer.
pub struct SgdParams {
    #[validate(range(min = 0.0))]
    pub lr: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub momentum: f64,
    #[validate(range(min = 0.0))]
    pub weight_decay: f64,
}

impl Default for SgdParams {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
/// The arguments of the `adam` optimizer.
pub struct AdamParams {
    #[validate(range(min = 0.0))]
    pub lr: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub beta1: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub beta2: f64,
    #[validate(range(min = 0.0))]
    pub epsilon: f64,
    #[validate(range(min = 0.0))]
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
/// The arguments of the `step_lr` scheduler.
pub struct StepLrParams {
    /// The number of steps between two decays.
    #[validate(range(min = 1))]
    pub step_size: u64,
    /// The decay factor.
    #[validate(range(min = 0.0))]
    pub gamma: f64,
}

impl Default for StepLrParams {
    fn default() -> Self {
        Self {
            step_size: 1,
            gamma: 1.0,
        }
    }
}

/// All factories of a run.
#[derive(Debug)]
pub struct Registry {
    /// Algorithms, built around the server optimizer.
    pub algorithms: Factories<ServerOptimizer, Algorithm>,
    pub models: Factories<ModelShape, Box<dyn Model>>,
    pub optimizers: Factories<(), Box<dyn Optimizer>>,
    /// Learning rate schedulers, built from the base learning rate.
    pub schedulers: Factories<f64, Box<dyn LrScheduler>>,
    pub losses: Factories<(), Box<dyn Loss>>,
    pub scores: Factories<(), ScoreFn>,
    pub data_managers: Factories<DataSource, Box<dyn DataManager>>,
}

impl Registry {
    /// Creates a registry without any factory.
    pub fn empty() -> Self {
        Self {
            algorithms: Factories::new("algorithm"),
            models: Factories::new("model"),
            optimizers: Factories::new("optimizer"),
            schedulers: Factories::new("learning rate scheduler"),
            losses: Factories::new("loss"),
            scores: Factories::new("score"),
            data_managers: Factories::new("data manager"),
        }
    }

    /// Creates a registry holding the built-in components.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        registry.algorithms.register("fedavg", |server, args| {
            args.none()?;
            Ok(FedAvg::new(server).into())
        });
        registry.algorithms.register("fednova", |server, args| {
            args.none()?;
            Ok(FedNova::new(FedAvg::new(server)).into())
        });
        registry.algorithms.register("fedprox", |server, args| {
            Ok(FedProx::new(FedAvg::new(server), args.parse()?).into())
        });
        registry.algorithms.register("feddyn", |server, args| {
            Ok(FedDyn::new(FedAvg::new(server), args.parse()?).into())
        });

        registry.models.register("linear", |shape, args| {
            args.none()?;
            Ok(Box::new(Linear::new(shape.num_features, shape.num_outputs)))
        });

        registry.optimizers.register("sgd", |_, args| {
            let params: SgdParams = args.parse()?;
            Ok(Box::new(Sgd::new(
                params.lr,
                params.momentum,
                params.weight_decay,
            )))
        });
        registry.optimizers.register("adam", |_, args| {
            let params: AdamParams = args.parse()?;
            Ok(Box::new(Adam::new(
                params.lr,
                params.beta1,
                params.beta2,
                params.epsilon,
                params.weight_decay,
            )))
        });

        registry.schedulers.register("step_lr", |base_lr, args| {
            let params: StepLrParams = args.parse()?;
            Ok(Box::new(StepLr::new(base_lr, params.step_size, params.gamma)))
        });
        registry.schedulers.register("constant", |base_lr, args| {
            args.none()?;
            Ok(Box::new(ConstantLr::new(base_lr)))
        });

        registry.losses.register("cross_entropy", |_, args| {
            args.none()?;
            Ok(Box::new(CrossEntropy))
        });
        registry.losses.register("mse", |_, args| {
            args.none()?;
            Ok(Box::new(Mse))
        });

        registry.scores.register("accuracy", |_, args| {
            args.none()?;
            Ok(Arc::new(scores::accuracy))
        });
        registry.scores.register("cross_entropy", |_, args| {
            args.none()?;
            Ok(Arc::new(scores::cross_entropy))
        });
        registry.scores.register("mse", |_, args| {
            args.none()?;
            Ok(Arc::new(scores::mse))
        });

        registry.data_managers.register("synthetic", |source, args| {
            let params: SyntheticParams = args.parse()?;
            Ok(Box::new(SyntheticDataManager::new(
                source.num_clients,
                &params,
                source.seed,
            )))
        });

        registry
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
