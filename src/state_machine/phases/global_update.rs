use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, info};

use crate::{
    aggregation::Aggregator,
    algorithms::{AlgorithmError, Hooks},
    common::{Params, Value},
    state_machine::{
        events::{ModelUpdate, ScoreUpdate},
        phases::{Evaluation, Phase, PhaseError, PhaseName, PhaseState, RoundEnd, Shared},
        StateMachine,
    },
};

/// The name of the parameter snapshot which is broadcast as the global model.
pub(in crate::state_machine) const GLOBAL_MODEL: &str = "cloud";

/// The global update state.
///
/// Lets the algorithm update the global state from the aggregates of the round and reports the
/// aggregated local scores.
#[derive(Debug)]
pub struct GlobalUpdate {
    pub(in crate::state_machine) aggregator: Aggregator,
    /// The aggregated local scores.
    pub(in crate::state_machine) scores: BTreeMap<String, f64>,
    /// The updated global model.
    pub(in crate::state_machine) cloud_params: Option<Params>,
}

impl Phase for PhaseState<GlobalUpdate> {
    const NAME: PhaseName = PhaseName::GlobalUpdate;

    fn process(&mut self) -> Result<(), PhaseError> {
        let Shared {
            store, federation, ..
        } = &mut self.shared;
        let aggregates = federation
            .algorithm
            .optimize(store, &self.private.aggregator)
            .map_err(PhaseError::GlobalUpdate)?;
        let mut snapshots = federation
            .algorithm
            .deploy(store)
            .map_err(PhaseError::GlobalUpdate)?;
        self.private.cloud_params = snapshots.remove(GLOBAL_MODEL);

        self.private.scores = local_scores(aggregates).map_err(PhaseError::GlobalUpdate)?;
        let round_id = self.shared.round_id();
        for (key, value) in self.private.scores.iter() {
            self.shared.federation.report(round_id, key, *value)?;
        }
        info!(
            num_scores = self.private.scores.len(),
            "updated the global model"
        );
        Ok(())
    }

    fn broadcast(&mut self) {
        if let Some(cloud_params) = self.private.cloud_params.take() {
            debug!("broadcasting the updated global model");
            self.shared
                .events
                .broadcast_model(ModelUpdate::New(Arc::new(cloud_params)));
        }
        let scores = std::mem::take(&mut self.private.scores);
        self.shared
            .events
            .broadcast_scores(ScoreUpdate::New(Arc::new(scores)));
    }

    fn next(self) -> Option<StateMachine> {
        if self.shared.state.is_evaluation_round() {
            Some(PhaseState::<Evaluation>::new(self.shared).into())
        } else {
            Some(PhaseState::<RoundEnd>::new(self.shared).into())
        }
    }
}

impl PhaseState<GlobalUpdate> {
    /// Creates a new global update phase.
    pub fn new(shared: Shared, aggregator: Aggregator) -> Self {
        Self {
            private: GlobalUpdate {
                aggregator,
                scores: BTreeMap::new(),
                cloud_params: None,
            },
            shared,
        }
    }
}

/// Keeps the scalar aggregates, which are the weighted averages of the local scores.
fn local_scores(
    aggregates: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, f64>, AlgorithmError> {
    aggregates
        .into_iter()
        .map(|(key, value)| Ok((key, value.as_scalar()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algorithms::LOCAL_PARAMS,
        model::Model,
        state_machine::{
            events::EventSubscriber,
            tests::{builder::StateMachineBuilder, utils},
        },
        storage::{keys, Accessor, Scope},
    };

    fn global_update(round_id: u64, log_freq: u64) -> (StateMachine, EventSubscriber) {
        let aggregator = Aggregator::new();
        let num_parameters = utils::model().num_parameters();
        aggregator
            .accumulate(0, LOCAL_PARAMS, &Params::from_elem(num_parameters, 1.0).into(), 1.0)
            .unwrap();
        aggregator
            .accumulate(0, "clients.train.accuracy", &Value::Scalar(0.5), 1.0)
            .unwrap();
        aggregator
            .accumulate(1, "clients.train.accuracy", &Value::Scalar(1.0), 3.0)
            .unwrap();

        let (mut state_machine, events) = StateMachineBuilder::new()
            .with_round_id(round_id)
            .with_initialized_store()
            .with_phase(GlobalUpdate {
                aggregator,
                scores: BTreeMap::new(),
                cloud_params: None,
            })
            .build();
        state_machine.shared_mut().state.log_freq = log_freq;
        (state_machine, events)
    }

    #[test]
    fn test_global_update_to_round_end() {
        let (state_machine, events) = global_update(1, 2);
        assert!(state_machine.is_global_update());

        let state_machine = state_machine.next().unwrap();
        assert!(state_machine.is_round_end());

        // a server SGD step with a learning rate of 1 replaces the global model by the average
        let shared = state_machine.shared();
        let cloud_params = shared
            .store
            .read_vector(Accessor::Server, Scope::Server, keys::CLOUD_PARAMS)
            .unwrap();
        assert!(cloud_params.iter().all(|p| (p - 1.0).abs() < 1e-12));
        assert_eq!(
            events.model_listener().get_latest().event,
            ModelUpdate::New(Arc::new(cloud_params.clone()))
        );

        match events.scores_listener().get_latest().event {
            ScoreUpdate::New(scores) => {
                assert!((scores["clients.train.accuracy"] - 0.875).abs() < 1e-12)
            }
            ScoreUpdate::Invalidate => panic!("expected the aggregated local scores"),
        }
        assert_eq!(
            shared.federation.summary.latest("clients.train.accuracy"),
            Some(0.875)
        );
    }

    #[test]
    fn test_global_update_to_evaluation() {
        let (state_machine, _) = global_update(2, 2);
        let state_machine = state_machine.next().unwrap();
        assert!(state_machine.is_evaluation());
    }
}
