use tracing::{debug, info};

use crate::state_machine::{
    phases::{Done, Phase, PhaseError, PhaseName, PhaseState, RoundStart, Shared},
    StateMachine,
};

/// The round end state.
///
/// Flushes the metric log and checks whether the run is over.
#[derive(Debug)]
pub struct RoundEnd;

impl Phase for PhaseState<RoundEnd> {
    const NAME: PhaseName = PhaseName::RoundEnd;

    fn process(&mut self) -> Result<(), PhaseError> {
        let Shared {
            state, federation, ..
        } = &mut self.shared;
        federation.metrics.flush()?;

        if let Some(early_stop) = federation.early_stop.as_ref() {
            match federation.summary.latest(&early_stop.key) {
                Some(score) if early_stop.is_reached(score) => {
                    info!(
                        key = %early_stop.key,
                        score,
                        threshold = early_stop.threshold,
                        "early stop condition reached"
                    );
                    state.stopped_early = true;
                }
                Some(_) => {}
                None => debug!(key = %early_stop.key, "no score reported for the early stop yet"),
            }
        }
        Ok(())
    }

    fn next(self) -> Option<StateMachine> {
        if self.shared.state.is_last_round() {
            info!(round_id = self.shared.round_id(), "federation finished");
            Some(PhaseState::<Done>::new(self.shared, None).into())
        } else {
            Some(PhaseState::<RoundStart>::new(self.shared).into())
        }
    }
}

impl PhaseState<RoundEnd> {
    /// Creates a new round end phase.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: RoundEnd,
            shared,
        }
    }
}
