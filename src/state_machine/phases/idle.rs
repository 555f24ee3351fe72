use std::sync::Arc;

use tracing::info;

use crate::{
    algorithms::{AlgorithmError, Hooks},
    common::Params,
    state_machine::{
        events::ModelUpdate,
        phases::{PhaseError, Phase, PhaseName, PhaseState, RoundStart, Shared},
        StateMachine,
    },
    storage::{keys, Accessor, Scope},
};

/// The idle state.
///
/// Writes the dataset statistics into the shared namespace, seals it and lets the algorithm
/// write its initial state.
#[derive(Debug)]
pub struct Idle {
    /// The initial global parameters.
    pub(in crate::state_machine) cloud_params: Option<Arc<Params>>,
}

impl Phase for PhaseState<Idle> {
    const NAME: PhaseName = PhaseName::Idle;

    fn process(&mut self) -> Result<(), PhaseError> {
        self.init_shared_namespace().map_err(PhaseError::Idle)?;

        let init_params = self.shared.federation.model.parameters();
        let Shared {
            store, federation, ..
        } = &mut self.shared;
        federation
            .algorithm
            .init(store, &init_params)
            .map_err(PhaseError::Idle)?;
        info!(
            algorithm = %federation.algorithm.name(),
            num_parameters = init_params.len(),
            "initialized the algorithm"
        );

        self.private.cloud_params = Some(Arc::new(init_params));
        Ok(())
    }

    fn broadcast(&mut self) {
        if let Some(cloud_params) = self.private.cloud_params.take() {
            info!("broadcasting the initial global model");
            self.shared
                .events
                .broadcast_model(ModelUpdate::New(cloud_params));
        }
    }

    fn next(self) -> Option<StateMachine> {
        Some(PhaseState::<RoundStart>::new(self.shared).into())
    }
}

impl PhaseState<Idle> {
    /// Creates a new idle phase.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Idle { cloud_params: None },
            shared,
        }
    }

    /// Writes the number of clients, the total number of training samples and the average
    /// number of training samples per client, then seals the shared namespace.
    fn init_shared_namespace(&mut self) -> Result<(), AlgorithmError> {
        let data = self.shared.federation.data.as_ref();
        let num_clients = data.num_clients();
        let total_train_samples = data.total_train_samples();
        let average_sample = total_train_samples as f64 / num_clients.max(1) as f64;

        let store = &mut self.shared.store;
        store.write(Accessor::Server, Scope::Shared, keys::NUM_CLIENTS, num_clients)?;
        store.write(
            Accessor::Server,
            Scope::Shared,
            keys::TOTAL_TRAIN_SAMPLES,
            total_train_samples,
        )?;
        store.write(
            Accessor::Server,
            Scope::Shared,
            keys::AVERAGE_SAMPLE,
            average_sample,
        )?;
        store.seal_shared();

        info!(
            num_clients,
            total_train_samples, average_sample, "sealed the shared namespace"
        );
        Ok(())
    }
}
