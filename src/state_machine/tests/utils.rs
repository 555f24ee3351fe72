use std::sync::Arc;

use rayon::ThreadPoolBuilder;

use crate::{
    algorithms::{Algorithm, FedAvg, Hooks, ServerOptimizer},
    data::{DataManager, SyntheticDataManager, SyntheticParams},
    metrics::NoopLogger,
    model::{CrossEntropy, Linear, Model},
    optim::Sgd,
    sampling::{ClientSampler, SampleScheme},
    scores::{self, ScoreHooks, ScoreSummary},
    state_machine::{
        coordinator::FederationState,
        events::{EventPublisher, EventSubscriber, ModelUpdate},
        phases::{Federation, PhaseName, Shared},
    },
    storage::{keys, Accessor, Scope, Store},
    training::TrainingConfig,
};

pub const NUM_CLIENTS: usize = 4;

/// A learning rate which makes every local training diverge in its first step.
pub const DIVERGING_LR: f64 = f64::INFINITY;

pub fn data() -> SyntheticDataManager {
    let params = SyntheticParams {
        num_features: 4,
        num_classes: 3,
        min_samples: 10,
        max_samples: 20,
        global_test_samples: 40,
        ..SyntheticParams::default()
    };
    SyntheticDataManager::new(NUM_CLIENTS, &params, 0)
}

pub fn model() -> Linear {
    Linear::new(4, 3)
}

pub fn federation_state() -> FederationState {
    FederationState {
        round_id: 0,
        rounds: 10,
        seed: 0,
        log_freq: 1,
        local_lr: 0.1,
        stopped_early: false,
    }
}

/// A federation of [`NUM_CLIENTS`] clients running FedAvg with a server learning rate of `1`.
pub fn federation() -> Federation {
    let data = data();

    let mut score_hooks = ScoreHooks::new();
    for split in data.global_split_names() {
        score_hooks.hook_global_score(&split, "accuracy", Arc::new(scores::accuracy));
    }
    for split in data.local_split_names() {
        score_hooks.hook_local_score(&split, "accuracy", Arc::new(scores::accuracy));
    }

    Federation {
        algorithm: Algorithm::from(FedAvg::new(ServerOptimizer::new(
            Box::new(Sgd::new(1.0, 0.0, 0.0)),
            None,
        ))),
        data: Box::new(data),
        sampler: ClientSampler::new(SampleScheme::Sequential, 0.5, NUM_CLIENTS, 0),
        model: Box::new(model()),
        loss: Box::new(CrossEntropy),
        local_optimizer: Box::new(Sgd::new(0.1, 0.0, 0.0)),
        local_scheduler: None,
        r2r_scheduler: None,
        training: TrainingConfig {
            epochs: 2,
            batch_size: 4,
        },
        test_batch_size: 16,
        score_hooks,
        summary: ScoreSummary::new(5),
        early_stop: None,
        metrics: Box::new(NoopLogger),
        pool: ThreadPoolBuilder::new().num_threads(2).build().unwrap(),
    }
}

pub fn init_shared() -> (Shared, EventSubscriber) {
    init_shared_with(federation_state())
}

pub fn init_shared_with(state: FederationState) -> (Shared, EventSubscriber) {
    let (event_publisher, event_subscriber) =
        EventPublisher::init(state.round_id, PhaseName::Idle, ModelUpdate::Invalidate);
    let store = Store::new(NUM_CLIENTS);
    let shared = Shared::new(state, event_publisher, store, federation());
    (shared, event_subscriber)
}

/// Leaves the store as the idle phase does.
pub fn initialize_store(shared: &mut Shared) {
    let data = shared.federation.data.as_ref();
    let num_clients = data.num_clients();
    let total_train_samples = data.total_train_samples();

    let store = &mut shared.store;
    store
        .write(Accessor::Server, Scope::Shared, keys::NUM_CLIENTS, num_clients)
        .unwrap();
    store
        .write(
            Accessor::Server,
            Scope::Shared,
            keys::TOTAL_TRAIN_SAMPLES,
            total_train_samples,
        )
        .unwrap();
    store
        .write(
            Accessor::Server,
            Scope::Shared,
            keys::AVERAGE_SAMPLE,
            total_train_samples as f64 / num_clients as f64,
        )
        .unwrap();
    store.seal_shared();

    let init_params = shared.federation.model.parameters();
    shared
        .federation
        .algorithm
        .init(&mut shared.store, &init_params)
        .unwrap();
}
