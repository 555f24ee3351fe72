use thiserror::Error;
use tracing::error;

use crate::{
    algorithms::AlgorithmError,
    metrics::MetricsError,
    state_machine::{
        events::{ModelUpdate, ScoreUpdate},
        phases::{Done, Phase, PhaseName, PhaseState, Shared},
        StateMachine,
    },
};

/// Errors which can occur during the execution of the [`StateMachine`].
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("idle phase failed: {0}")]
    Idle(AlgorithmError),
    #[error("local training phase failed: {0}")]
    LocalTraining(AlgorithmError),
    #[error("aggregation phase failed: {0}")]
    Aggregation(AlgorithmError),
    #[error("global update phase failed: {0}")]
    GlobalUpdate(AlgorithmError),
    #[error("evaluation phase failed: {0}")]
    Evaluation(AlgorithmError),
    #[error("metric logging failed: {0}")]
    Metrics(#[from] MetricsError),
}

/// The failure state.
#[derive(Debug)]
pub struct Failure {
    pub(in crate::state_machine) error: PhaseError,
}

impl Phase for PhaseState<Failure> {
    const NAME: PhaseName = PhaseName::Failure;

    fn process(&mut self) -> Result<(), PhaseError> {
        error!("phase state error: {}", self.private.error);
        Ok(())
    }

    fn broadcast(&mut self) {
        self.shared.events.broadcast_model(ModelUpdate::Invalidate);
        self.shared.events.broadcast_scores(ScoreUpdate::Invalidate);
    }

    fn next(self) -> Option<StateMachine> {
        Some(PhaseState::<Done>::new(self.shared, Some(self.private.error)).into())
    }
}

impl PhaseState<Failure> {
    /// Creates a new failure phase.
    pub fn new(shared: Shared, error: PhaseError) -> Self {
        Self {
            private: Failure { error },
            shared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{state_machine::tests::builder::StateMachineBuilder, storage::StoreError};

    #[test]
    fn test_failure_to_done() {
        let (state_machine, events) = StateMachineBuilder::new()
            .with_round_id(2)
            .with_phase(Failure {
                error: PhaseError::GlobalUpdate(AlgorithmError::Store(StoreError::UnknownClient(9))),
            })
            .build();
        assert!(state_machine.is_failure());

        let state_machine = state_machine.next().unwrap();
        assert!(state_machine.is_done());

        assert_eq!(
            events.phase_listener().get_latest().event,
            PhaseName::Failure
        );
        assert_eq!(
            events.model_listener().get_latest().event,
            ModelUpdate::Invalidate
        );

        assert!(matches!(
            state_machine.run(),
            Err(PhaseError::GlobalUpdate(AlgorithmError::Store(
                StoreError::UnknownClient(9)
            )))
        ));
    }
}
