use tracing::{debug, info};

use crate::state_machine::{
    phases::{ClientSelection, Phase, PhaseError, PhaseName, PhaseState, Shared},
    StateMachine,
};

/// The round start state.
///
/// Advances the round and the round to round schedule of the client learning rate.
#[derive(Debug)]
pub struct RoundStart;

impl Phase for PhaseState<RoundStart> {
    const NAME: PhaseName = PhaseName::RoundStart;

    fn process(&mut self) -> Result<(), PhaseError> {
        let round_id = self.shared.round_id() + 1;
        self.shared.set_round_id(round_id);

        if round_id > 1 {
            if let Some(scheduler) = self.shared.federation.r2r_scheduler.as_mut() {
                let local_lr = scheduler.step();
                debug!(local_lr, "stepped the client learning rate");
                self.shared.state.local_lr = local_lr;
            }
        }

        info!(
            round_id,
            rounds = self.shared.state.rounds,
            local_lr = self.shared.state.local_lr,
            "starting round"
        );
        Ok(())
    }

    fn next(self) -> Option<StateMachine> {
        Some(PhaseState::<ClientSelection>::new(self.shared).into())
    }
}

impl PhaseState<RoundStart> {
    /// Creates a new round start phase.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: RoundStart,
            shared,
        }
    }
}
