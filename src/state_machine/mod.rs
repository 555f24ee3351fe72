//! The state machine that drives a federated learning run.
//!
//! # Overview
//!
//! ```text
//! Idle -> RoundStart -> ClientSelection -> LocalTraining -> Aggregation -> GlobalUpdate
//!             ^                |                                              |
//!             |                |                                     (evaluation round)
//!             |                v                                              v
//!             +----------- RoundEnd <------------------------------------ Evaluation
//!                              |
//!                              v
//!                             Done <- Failure <- (any failing phase)
//! ```
//!
//! The [`StateMachine`] runs the rounds of a federation: it selects the participating clients,
//! runs their local training on a worker pool, aggregates their messages and updates the global
//! model through the hooks of the configured [`Algorithm`].
//!
//! # Phase states
//!
//! **Idle**
//!
//! Publishes [`PhaseName::Idle`], writes the dataset statistics into the shared namespace of the
//! store, seals it and initializes the algorithm state. Publishes the initial global model.
//!
//! **RoundStart**
//!
//! Publishes [`PhaseName::RoundStart`], increments the `round id` by `1` and steps the round to
//! round schedule of the client learning rate.
//!
//! **ClientSelection**
//!
//! Publishes [`PhaseName::ClientSelection`], samples and publishes the clients of the round. A
//! round without any selected client is skipped.
//!
//! **LocalTraining**
//!
//! Publishes [`PhaseName::LocalTraining`] and runs the local round of every selected client.
//!
//! **Aggregation**
//!
//! Publishes [`PhaseName::Aggregation`] and accumulates the client messages in the order of the
//! selection.
//!
//! **GlobalUpdate**
//!
//! Publishes [`PhaseName::GlobalUpdate`], updates the global state, reports the aggregated local
//! scores and publishes the updated global model.
//!
//! **Evaluation**
//!
//! Publishes [`PhaseName::Evaluation`], reports and publishes the global scores of the deployed
//! models. Only runs every `log_freq` rounds.
//!
//! **RoundEnd**
//!
//! Publishes [`PhaseName::RoundEnd`], flushes the metric log and checks the early stop
//! condition and the number of rounds.
//!
//! **Failure**
//!
//! Publishes [`PhaseName::Failure`] and invalidates the published model and scores. A failure
//! aborts the run.
//!
//! **Done**
//!
//! Publishes [`PhaseName::Done`], closes the metric log and summarizes the reported scores.
//!
//! # Events
//!
//! Everyone who is interested in the progress of a run can subscribe to its events via the
//! [`EventSubscriber`] which is created together with the [`StateMachine`] by
//! [`StateMachineInitializer::init()`].
//!
//! [`Algorithm`]: crate::algorithms::Algorithm
//! [`PhaseName::Idle`]: crate::state_machine::phases::PhaseName::Idle
//! [`PhaseName::RoundStart`]: crate::state_machine::phases::PhaseName::RoundStart
//! [`PhaseName::ClientSelection`]: crate::state_machine::phases::PhaseName::ClientSelection
//! [`PhaseName::LocalTraining`]: crate::state_machine::phases::PhaseName::LocalTraining
//! [`PhaseName::Aggregation`]: crate::state_machine::phases::PhaseName::Aggregation
//! [`PhaseName::GlobalUpdate`]: crate::state_machine::phases::PhaseName::GlobalUpdate
//! [`PhaseName::Evaluation`]: crate::state_machine::phases::PhaseName::Evaluation
//! [`PhaseName::RoundEnd`]: crate::state_machine::phases::PhaseName::RoundEnd
//! [`PhaseName::Failure`]: crate::state_machine::phases::PhaseName::Failure
//! [`PhaseName::Done`]: crate::state_machine::phases::PhaseName::Done

pub mod coordinator;
pub mod events;
pub mod phases;

#[cfg(test)]
pub(crate) mod tests;

use std::collections::BTreeMap;

use derive_more::From;
use rayon::{ThreadPoolBuildError, ThreadPoolBuilder};
use thiserror::Error;
use tracing::{debug, info};

use self::{
    coordinator::FederationState,
    events::{EventPublisher, EventSubscriber, ModelUpdate},
    phases::{
        Aggregation,
        ClientSelection,
        Done,
        Evaluation,
        Failure,
        Federation,
        GlobalUpdate,
        Idle,
        LocalTraining,
        PhaseError,
        PhaseName,
        PhaseState,
        RoundEnd,
        RoundStart,
        Shared,
    },
};
use crate::{
    algorithms::ServerOptimizer,
    data::DataManager,
    metrics::{open_logger, MetricsError},
    optim::LrScheduler,
    registry::{Args, ConfigurationError, DataSource, ModelShape, Registry},
    sampling::ClientSampler,
    scores::{ScoreHooks, ScoreSummary},
    settings::{ComponentSettings, Settings},
    storage::Store,
    training::TrainingConfig,
};

/// The state machine with all its states.
#[derive(Debug, From)]
pub enum StateMachine {
    Idle(PhaseState<Idle>),
    RoundStart(PhaseState<RoundStart>),
    ClientSelection(PhaseState<ClientSelection>),
    LocalTraining(PhaseState<LocalTraining>),
    Aggregation(PhaseState<Aggregation>),
    GlobalUpdate(PhaseState<GlobalUpdate>),
    Evaluation(PhaseState<Evaluation>),
    RoundEnd(PhaseState<RoundEnd>),
    Failure(PhaseState<Failure>),
    Done(PhaseState<Done>),
}

impl StateMachine {
    /// Moves the [`StateMachine`] to the next state and consumes the current one.
    /// Returns the next state or `None` if the [`StateMachine`] reached the state [`Done`].
    pub fn next(self) -> Option<Self> {
        match self {
            StateMachine::Idle(state) => state.run_phase(),
            StateMachine::RoundStart(state) => state.run_phase(),
            StateMachine::ClientSelection(state) => state.run_phase(),
            StateMachine::LocalTraining(state) => state.run_phase(),
            StateMachine::Aggregation(state) => state.run_phase(),
            StateMachine::GlobalUpdate(state) => state.run_phase(),
            StateMachine::Evaluation(state) => state.run_phase(),
            StateMachine::RoundEnd(state) => state.run_phase(),
            StateMachine::Failure(state) => state.run_phase(),
            StateMachine::Done(state) => state.run_phase(),
        }
    }

    /// Runs the state machine until it is done.
    ///
    /// Returns the mean of the most recent reports of every score, or the error which aborted
    /// the run.
    pub fn run(mut self) -> Result<BTreeMap<String, f64>, PhaseError> {
        loop {
            self = match self {
                StateMachine::Done(state) => return state.finish(),
                state => match state.next() {
                    Some(state) => state,
                    None => unreachable!("only the done phase ends a run"),
                },
            };
        }
    }
}

/// Error that can occur during the initialization of the [`StateMachine`].
#[derive(Debug, Error)]
pub enum StateMachineInitializationError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("failed to open the metric log: {0}")]
    Metrics(#[from] MetricsError),
    #[error("failed to build the worker pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
}

type StateMachineInitializationResult<T> = Result<T, StateMachineInitializationError>;

/// The state machine initializer that builds the components of a run from the settings.
#[derive(Debug)]
pub struct StateMachineInitializer {
    settings: Settings,
    registry: Registry,
}

impl StateMachineInitializer {
    /// Creates a new [`StateMachineInitializer`].
    pub fn new(settings: Settings, registry: Registry) -> Self {
        Self { settings, registry }
    }

    /// Initializes a new [`StateMachine`] with the given settings.
    ///
    /// # Errors
    /// Fails if a component is unknown to the registry, if its arguments are rejected or if the
    /// components don't fit together, e.g. when the model doesn't have as many outputs as the
    /// data.
    pub fn init(self) -> StateMachineInitializationResult<(StateMachine, EventSubscriber)> {
        let Self { settings, registry } = self;
        let federation_settings = settings.federation;
        let seed = federation_settings.seed;

        let data = registry.data_managers.build(
            &settings.data.name,
            DataSource {
                num_clients: federation_settings.num_clients,
                seed,
            },
            &settings.data.args,
        )?;
        if data.num_clients() != federation_settings.num_clients {
            return Err(ConfigurationError::Incompatible(format!(
                "the data manager partitions the data among {} clients, but {} are configured",
                data.num_clients(),
                federation_settings.num_clients
            ))
            .into());
        }

        let model = registry.models.build(
            &settings.model.name,
            ModelShape {
                num_features: data.num_features(),
                num_outputs: data.num_outputs(),
            },
            &settings.model.args,
        )?;
        if model.num_outputs() != data.num_outputs() {
            return Err(ConfigurationError::Incompatible(format!(
                "the model has {} outputs, but the data has {}",
                model.num_outputs(),
                data.num_outputs()
            ))
            .into());
        }

        let loss = registry
            .losses
            .build(&settings.training.loss, (), &Args::new())?;
        if settings.training.loss == "cross_entropy" && data.num_outputs() < 2 {
            return Err(ConfigurationError::Incompatible(
                "the cross entropy needs at least two classes".to_string(),
            )
            .into());
        }

        let optimizer =
            registry
                .optimizers
                .build(&settings.optimizer.name, (), &settings.optimizer.args)?;
        let scheduler = build_scheduler(&registry, settings.lr_scheduler.as_ref(), optimizer.lr())?;
        let algorithm = registry.algorithms.build(
            &settings.algorithm.name,
            ServerOptimizer::new(optimizer, scheduler),
            &settings.algorithm.args,
        )?;

        let local_optimizer = registry.optimizers.build(
            &settings.local_optimizer.name,
            (),
            &settings.local_optimizer.args,
        )?;
        let local_lr = local_optimizer.lr();
        let local_scheduler =
            build_scheduler(&registry, settings.local_lr_scheduler.as_ref(), local_lr)?;
        let r2r_scheduler =
            build_scheduler(&registry, settings.r2r_local_lr_scheduler.as_ref(), local_lr)?;

        let score_hooks = hook_scores(
            &registry,
            data.as_ref(),
            &settings.summary.global_scores,
            &settings.summary.local_scores,
        )?;

        let sampler = ClientSampler::new(
            settings.sampling.scheme,
            settings.sampling.rate,
            federation_settings.num_clients,
            seed,
        );
        let metrics = open_logger(settings.log.dir.as_deref())?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.concurrency.workers)
            .thread_name(|index| format!("fedsim-worker-{}", index))
            .build()?;

        info!(
            algorithm = %algorithm.name(),
            num_clients = federation_settings.num_clients,
            rounds = federation_settings.rounds,
            workers = settings.concurrency.workers,
            "initialized the federation"
        );
        debug!(?data, ?model, "components");

        let federation = Federation {
            algorithm,
            data,
            sampler,
            model,
            loss,
            local_optimizer,
            local_scheduler,
            r2r_scheduler,
            training: TrainingConfig {
                epochs: settings.training.epochs,
                batch_size: settings.training.batch_size,
            },
            test_batch_size: settings.training.test_batch_size,
            score_hooks,
            summary: ScoreSummary::new(settings.summary.n_point_summary),
            early_stop: settings.early_stop.clone(),
            metrics,
            pool,
        };
        let state = FederationState::new(&federation_settings, &settings.summary, local_lr);
        Ok(init_state_machine(state, federation))
    }
}

fn build_scheduler(
    registry: &Registry,
    settings: Option<&ComponentSettings>,
    base_lr: f64,
) -> Result<Option<Box<dyn LrScheduler>>, ConfigurationError> {
    settings
        .map(|settings| {
            registry
                .schedulers
                .build(&settings.name, base_lr, &settings.args)
        })
        .transpose()
}

/// Hooks every global score on every global split and every local score on every local split.
fn hook_scores(
    registry: &Registry,
    data: &dyn DataManager,
    global_scores: &[String],
    local_scores: &[String],
) -> Result<ScoreHooks, ConfigurationError> {
    let mut hooks = ScoreHooks::new();
    for name in global_scores {
        let score = registry.scores.build(name, (), &Args::new())?;
        for split in data.global_split_names() {
            hooks.hook_global_score(&split, name, score.clone());
        }
    }
    for name in local_scores {
        let score = registry.scores.build(name, (), &Args::new())?;
        for split in data.local_split_names() {
            hooks.hook_local_score(&split, name, score.clone());
        }
    }
    Ok(hooks)
}

// Initializes a new [`StateMachine`] with its components.
fn init_state_machine(
    state: FederationState,
    federation: Federation,
) -> (StateMachine, EventSubscriber) {
    let (event_publisher, event_subscriber) =
        EventPublisher::init(state.round_id, PhaseName::Idle, ModelUpdate::Invalidate);
    let store = Store::new(federation.data.num_clients());
    let shared = Shared::new(state, event_publisher, store, federation);
    let state_machine = StateMachine::from(PhaseState::<Idle>::new(shared));
    (state_machine, event_subscriber)
}

#[cfg(test)]
mod init_tests {
    use ndarray::{ArrayView1, ArrayView2};
    use serde_json::json;

    use super::*;
    use crate::{
        algorithms::{AlgorithmError, AlgorithmName},
        sampling::SampleScheme,
        scores::ScoreFn,
        settings::{EarlyStopSettings, StopMode},
        training::TrainingError,
    };

    fn settings(algorithm: AlgorithmName) -> Settings {
        let mut settings = Settings::new("configs/config.toml").unwrap();
        settings.federation.rounds = 20;
        settings.federation.num_clients = 10;
        settings.sampling.scheme = SampleScheme::Uniform;
        settings.sampling.rate = 0.5;
        settings.algorithm = ComponentSettings {
            name: algorithm.to_string(),
            args: Args::new(),
        };
        settings.training.epochs = 2;
        settings.summary.log_freq = 5;
        settings.summary.n_point_summary = 1;
        settings.data.args = serde_json::from_value(json!({
            "num_features": 5,
            "num_classes": 3,
            "global_test_samples": 300,
            "noise": 0.05
        }))
        .unwrap();
        settings.concurrency.workers = 2;
        settings.log.dir = None;
        settings
    }

    fn run(settings: Settings) -> Result<BTreeMap<String, f64>, PhaseError> {
        let (state_machine, _) = StateMachineInitializer::new(settings, Registry::with_defaults())
            .init()
            .unwrap();
        state_machine.run()
    }

    fn assert_learns(algorithm: AlgorithmName) {
        let summary = run(settings(algorithm)).unwrap();
        let accuracy = summary["server.cloud.test.accuracy"];
        assert!(
            accuracy > 0.5,
            "{} reached a test accuracy of {}",
            algorithm,
            accuracy
        );
        assert!(summary.contains_key("server.cloud.test.cross_entropy"));
        assert!(summary.contains_key("clients.train.accuracy"));
    }

    #[test]
    fn test_fedavg_learns() {
        assert_learns(AlgorithmName::FedAvg);
    }

    #[test]
    fn test_fednova_learns() {
        assert_learns(AlgorithmName::FedNova);
    }

    #[test]
    fn test_fedprox_learns() {
        assert_learns(AlgorithmName::FedProx);
    }

    #[test]
    fn test_feddyn_learns() {
        assert_learns(AlgorithmName::FedDyn);
    }

    #[test]
    fn test_runs_are_reproducible() {
        let mut settings_a = settings(AlgorithmName::FedAvg);
        settings_a.federation.rounds = 5;
        let mut settings_b = settings(AlgorithmName::FedAvg);
        settings_b.federation.rounds = 5;
        settings_b.concurrency.workers = 1;
        assert_eq!(run(settings_a).unwrap(), run(settings_b).unwrap());
    }

    #[test]
    fn test_empty_selections_are_skipped() {
        let mut settings = settings(AlgorithmName::FedAvg);
        settings.federation.rounds = 5;
        settings.sampling.rate = 0.01;

        let (state_machine, events) =
            StateMachineInitializer::new(settings, Registry::with_defaults())
                .init()
                .unwrap();
        // rounds without clients neither update nor evaluate the global model
        assert!(state_machine.run().unwrap().is_empty());
        let phase = events.phase_listener().get_latest();
        assert_eq!(phase.event, PhaseName::Done);
        assert_eq!(phase.round_id, 5);
    }

    fn constant(_outputs: ArrayView2<f64>, _targets: ArrayView1<f64>) -> f64 {
        0.25
    }

    #[test]
    fn test_constant_global_score() {
        let mut settings = settings(AlgorithmName::FedAvg);
        settings.federation.rounds = 3;
        settings.summary.log_freq = 1;
        settings.summary.n_point_summary = 3;
        settings.summary.global_scores = vec!["constant".to_string()];
        settings.summary.local_scores = Vec::new();

        let mut registry = Registry::with_defaults();
        registry.scores.register("constant", |_, args| {
            args.none()?;
            let score: ScoreFn = std::sync::Arc::new(constant);
            Ok(score)
        });

        let (state_machine, _) = StateMachineInitializer::new(settings, registry)
            .init()
            .unwrap();
        let summary = state_machine.run().unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary["server.cloud.test.constant"], 0.25);
    }

    #[test]
    fn test_early_stop() {
        let mut settings = settings(AlgorithmName::FedAvg);
        settings.summary.log_freq = 1;
        settings.early_stop = Some(EarlyStopSettings {
            key: "server.cloud.test.accuracy".to_string(),
            threshold: 0.0,
            mode: StopMode::Above,
        });

        let (state_machine, events) =
            StateMachineInitializer::new(settings, Registry::with_defaults())
                .init()
                .unwrap();
        state_machine.run().unwrap();
        assert_eq!(events.phase_listener().get_latest().round_id, 1);
    }

    #[test]
    fn test_divergence_aborts_the_run() {
        let mut settings = settings(AlgorithmName::FedAvg);
        settings.local_optimizer.args =
            serde_json::from_value(json!({ "lr": f64::MAX })).unwrap();
        settings.local_lr_scheduler = None;
        settings.r2r_local_lr_scheduler = None;

        let (state_machine, events) =
            StateMachineInitializer::new(settings, Registry::with_defaults())
                .init()
                .unwrap();
        assert!(matches!(
            state_machine.run(),
            Err(PhaseError::LocalTraining(AlgorithmError::Training(
                TrainingError::NumericDivergence { .. }
            )))
        ));
        assert_eq!(
            events.model_listener().get_latest().event,
            ModelUpdate::Invalidate
        );
    }

    #[test]
    fn test_incompatible_components() {
        let mut settings = settings(AlgorithmName::FedAvg);
        settings.data.args = serde_json::from_value(json!({ "task": "regression" })).unwrap();
        assert!(matches!(
            StateMachineInitializer::new(settings, Registry::with_defaults()).init(),
            Err(StateMachineInitializationError::Configuration(
                ConfigurationError::Incompatible(_)
            ))
        ));

        let mut settings = self::settings(AlgorithmName::FedAvg);
        settings.algorithm.name = "scaffold".to_string();
        assert!(matches!(
            StateMachineInitializer::new(settings, Registry::with_defaults()).init(),
            Err(StateMachineInitializationError::Configuration(
                ConfigurationError::UnknownName { .. }
            ))
        ));

        let mut settings = self::settings(AlgorithmName::FedAvg);
        settings.summary.global_scores.push("f1".to_string());
        assert!(matches!(
            StateMachineInitializer::new(settings, Registry::with_defaults()).init(),
            Err(StateMachineInitializationError::Configuration(
                ConfigurationError::UnknownName { .. }
            ))
        ));
    }
}
