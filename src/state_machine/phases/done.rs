use std::collections::BTreeMap;

use tracing::{error_span, info, warn};

use crate::state_machine::{
    phases::{Phase, PhaseError, PhaseName, PhaseState, Shared},
    StateMachine,
};

/// The done state.
///
/// Summarizes the run and closes the metric log. A run which ended in the failure state carries
/// the error which caused it.
#[derive(Debug)]
pub struct Done {
    pub(in crate::state_machine) error: Option<PhaseError>,
    /// The mean of the last reports of every score.
    pub(in crate::state_machine) summary: BTreeMap<String, f64>,
}

impl Phase for PhaseState<Done> {
    const NAME: PhaseName = PhaseName::Done;

    fn process(&mut self) -> Result<(), PhaseError> {
        let federation = &mut self.shared.federation;
        if let Err(err) = federation.metrics.close() {
            match self.private.error {
                Some(_) => warn!("failed to close the metric log: {}", err),
                None => return Err(err.into()),
            }
        }

        self.private.summary = federation.summary.summary();
        info!(
            "average of the last {} reports: {:?}",
            federation.summary.window(),
            self.private.summary
        );
        Ok(())
    }

    fn next(self) -> Option<StateMachine> {
        None
    }
}

impl PhaseState<Done> {
    /// Creates a new done phase.
    pub fn new(shared: Shared, error: Option<PhaseError>) -> Self {
        Self {
            private: Done {
                error,
                summary: BTreeMap::new(),
            },
            shared,
        }
    }

    /// Ends the run.
    ///
    /// Returns the summary of the reported scores, or the error which made the run fail.
    pub fn finish(mut self) -> Result<BTreeMap<String, f64>, PhaseError> {
        let span = error_span!("run_phase", phase = %Self::NAME, round_id = self.shared.round_id());
        let _span_guard = span.enter();
        self.shared.events.broadcast_phase(Self::NAME);

        if let Err(err) = self.process() {
            return Err(self.private.error.take().unwrap_or(err));
        }
        match self.private.error {
            Some(err) => Err(err),
            None => Ok(self.private.summary),
        }
    }
}
