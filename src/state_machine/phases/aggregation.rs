use tracing::debug;

use crate::{
    aggregation::Aggregator,
    algorithms::{ClientMessage, Hooks},
    common::ClientId,
    state_machine::{
        phases::{GlobalUpdate, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
};

/// The aggregation state.
///
/// Feeds the client messages into the aggregator of the round.
#[derive(Debug)]
pub struct Aggregation {
    pub(in crate::state_machine) messages: Vec<(ClientId, ClientMessage)>,
    pub(in crate::state_machine) aggregator: Aggregator,
}

impl Phase for PhaseState<Aggregation> {
    const NAME: PhaseName = PhaseName::Aggregation;

    fn process(&mut self) -> Result<(), PhaseError> {
        let algorithm = &self.shared.federation.algorithm;
        for (client_id, message) in self.private.messages.drain(..) {
            algorithm
                .receive_from_client(client_id, message, &self.private.aggregator)
                .map_err(PhaseError::Aggregation)?;
            debug!(client_id, "received client message");
        }
        Ok(())
    }

    fn next(self) -> Option<StateMachine> {
        Some(PhaseState::<GlobalUpdate>::new(self.shared, self.private.aggregator).into())
    }
}

impl PhaseState<Aggregation> {
    /// Creates a new aggregation phase.
    pub fn new(
        shared: Shared,
        messages: Vec<(ClientId, ClientMessage)>,
        aggregator: Aggregator,
    ) -> Self {
        Self {
            private: Aggregation {
                messages,
                aggregator,
            },
            shared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregation::AggregationError,
        algorithms::{AlgorithmError, LOCAL_PARAMS},
        common::Params,
        state_machine::tests::builder::StateMachineBuilder,
    };

    fn message(local_params: Params, num_samples: usize) -> ClientMessage {
        ClientMessage {
            local_params,
            num_samples,
            num_steps: 1,
            scores: Vec::new(),
        }
    }

    #[test]
    fn test_aggregation_to_global_update() {
        let messages = vec![
            (0, message(Params::from(vec![1.0, 2.0]), 1)),
            (1, message(Params::from(vec![3.0, 4.0]), 3)),
        ];
        let (state_machine, events) = StateMachineBuilder::new()
            .with_round_id(1)
            .with_phase(Aggregation {
                messages,
                aggregator: Aggregator::new(),
            })
            .build();
        assert!(state_machine.is_aggregation());

        let state_machine = state_machine.next().unwrap();
        assert!(state_machine.is_global_update());
        assert_eq!(
            events.phase_listener().get_latest().event,
            PhaseName::Aggregation
        );

        let global_update = state_machine.into_global_update_phase_state();
        let aggregator = &global_update.private.aggregator;
        assert_eq!(aggregator.get_weight(LOCAL_PARAMS).unwrap(), 4.0);
        assert_eq!(
            aggregator.pop(LOCAL_PARAMS).unwrap(),
            Params::from(vec![2.5, 3.5]).into()
        );
    }

    #[test]
    fn test_shape_mismatch_fails_the_round() {
        let messages = vec![
            (0, message(Params::from(vec![1.0, 2.0]), 1)),
            (1, message(Params::from(vec![3.0]), 1)),
        ];
        let (state_machine, _) = StateMachineBuilder::new()
            .with_round_id(1)
            .with_phase(Aggregation {
                messages,
                aggregator: Aggregator::new(),
            })
            .build();

        let state_machine = state_machine.next().unwrap();
        assert!(state_machine.is_failure());
        assert!(matches!(
            state_machine.run(),
            Err(PhaseError::Aggregation(AlgorithmError::Aggregation(
                AggregationError::ShapeMismatch { client_id: 1, .. }
            )))
        ));
    }
}
