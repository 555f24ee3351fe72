use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    common::ClientId,
    state_machine::{
        phases::{LocalTraining, Phase, PhaseError, PhaseName, PhaseState, RoundEnd, Shared},
        StateMachine,
    },
};

/// The client selection state.
#[derive(Debug)]
pub struct ClientSelection {
    /// The clients participating in the current round.
    pub(in crate::state_machine) clients: Arc<Vec<ClientId>>,
}

impl Phase for PhaseState<ClientSelection> {
    const NAME: PhaseName = PhaseName::ClientSelection;

    fn process(&mut self) -> Result<(), PhaseError> {
        let round_id = self.shared.round_id();
        let clients = self.shared.federation.sampler.sample(round_id);
        if clients.is_empty() {
            warn!("no client was selected, skipping the round");
        } else {
            info!(num_selected = clients.len(), "selected clients");
        }
        self.private.clients = Arc::new(clients);
        Ok(())
    }

    fn broadcast(&mut self) {
        self.shared
            .events
            .broadcast_selection(self.private.clients.clone());
    }

    fn next(self) -> Option<StateMachine> {
        let PhaseState { private, shared } = self;
        if private.clients.is_empty() {
            Some(PhaseState::<RoundEnd>::new(shared).into())
        } else {
            Some(PhaseState::<LocalTraining>::new(shared, private.clients).into())
        }
    }
}

impl PhaseState<ClientSelection> {
    /// Creates a new client selection phase.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: ClientSelection {
                clients: Arc::new(Vec::new()),
            },
            shared,
        }
    }
}
