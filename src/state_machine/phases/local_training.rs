use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    aggregation::Aggregator,
    algorithms::{AlgorithmError, ClientMessage, Hooks},
    common::ClientId,
    state_machine::{
        phases::{Aggregation, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::{keys, Accessor, Scope},
};

/// The local training state.
///
/// Runs the local round of every selected client on the worker pool. The messages are kept in
/// the order of the selection, independent of the order in which the clients finish.
#[derive(Debug)]
pub struct LocalTraining {
    /// The clients participating in the current round.
    pub(in crate::state_machine) clients: Arc<Vec<ClientId>>,
    /// The messages of the clients.
    pub(in crate::state_machine) messages: Vec<(ClientId, ClientMessage)>,
}

impl Phase for PhaseState<LocalTraining> {
    const NAME: PhaseName = PhaseName::LocalTraining;

    fn process(&mut self) -> Result<(), PhaseError> {
        self.private.messages = self.train_clients().map_err(PhaseError::LocalTraining)?;
        info!(
            num_messages = self.private.messages.len(),
            "local training finished"
        );
        Ok(())
    }

    fn next(self) -> Option<StateMachine> {
        let aggregator = Aggregator::new();
        Some(PhaseState::<Aggregation>::new(self.shared, self.private.messages, aggregator).into())
    }
}

impl PhaseState<LocalTraining> {
    /// Creates a new local training phase.
    pub fn new(shared: Shared, clients: Arc<Vec<ClientId>>) -> Self {
        Self {
            private: LocalTraining {
                clients,
                messages: Vec::new(),
            },
            shared,
        }
    }

    fn train_clients(&mut self) -> Result<Vec<(ClientId, ClientMessage)>, AlgorithmError> {
        let Shared {
            state,
            store,
            federation,
            ..
        } = &mut self.shared;
        let cloud_params = store
            .read_vector(Accessor::Server, Scope::Server, keys::CLOUD_PARAMS)?
            .clone();
        let views = store.client_views(&self.private.clients)?;

        let state = &*state;
        let resources = federation.client_resources();
        let algorithm = &federation.algorithm;
        debug!(
            workers = federation.pool.current_num_threads(),
            "dispatching the local rounds"
        );
        federation.pool.install(|| {
            views
                .into_par_iter()
                .map(|view| {
                    let client_id = view.client_id();
                    let mut ctx = resources.context(view, &cloud_params, state);
                    let message = algorithm.send_to_server(&mut ctx)?;
                    debug!(
                        client_id,
                        num_samples = message.num_samples,
                        num_steps = message.num_steps,
                        "client finished its local round"
                    );
                    Ok((client_id, message))
                })
                .collect()
        })
    }
}
