use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, info};

use crate::{
    algorithms::{AlgorithmError, Hooks},
    common::Params,
    scores::global_score_key,
    state_machine::{
        events::ScoreUpdate,
        phases::{Federation, Phase, PhaseError, PhaseName, PhaseState, RoundEnd, Shared},
        StateMachine,
    },
    training::predict,
};

/// The evaluation state.
///
/// Evaluates the global scores of every deployed parameter snapshot on the global splits.
#[derive(Debug)]
pub struct Evaluation {
    /// The global scores of this round.
    pub(in crate::state_machine) scores: BTreeMap<String, f64>,
}

impl Phase for PhaseState<Evaluation> {
    const NAME: PhaseName = PhaseName::Evaluation;

    fn process(&mut self) -> Result<(), PhaseError> {
        let Shared {
            store, federation, ..
        } = &self.shared;
        let snapshots = federation
            .algorithm
            .deploy(store)
            .map_err(PhaseError::Evaluation)?;
        let mut scores = BTreeMap::new();
        for (model_name, params) in snapshots.iter() {
            evaluate(federation, model_name, params, &mut scores).map_err(PhaseError::Evaluation)?;
        }

        let round_id = self.shared.round_id();
        for (key, value) in scores.iter() {
            info!(key = %key, value, "global score");
            self.shared.federation.report(round_id, key, *value)?;
        }
        self.private.scores = scores;
        Ok(())
    }

    fn broadcast(&mut self) {
        let scores = std::mem::take(&mut self.private.scores);
        self.shared
            .events
            .broadcast_scores(ScoreUpdate::New(Arc::new(scores)));
    }

    fn next(self) -> Option<StateMachine> {
        Some(PhaseState::<RoundEnd>::new(self.shared).into())
    }
}

impl PhaseState<Evaluation> {
    /// Creates a new evaluation phase.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Evaluation {
                scores: BTreeMap::new(),
            },
            shared,
        }
    }
}

/// Evaluates every global score hook on the snapshot `params`.
///
/// Hooks whose split is missing or empty are skipped.
fn evaluate(
    federation: &Federation,
    model_name: &str,
    params: &Params,
    scores: &mut BTreeMap<String, f64>,
) -> Result<(), AlgorithmError> {
    let mut model = federation.model.boxed_clone();
    model.set_parameters(params)?;

    for hook in federation.score_hooks.global_scores() {
        let split = match federation.data.global_split(&hook.split) {
            Some(split) if !split.is_empty() => split,
            _ => {
                debug!(split = %hook.split, "skipping a missing or empty split");
                continue;
            }
        };
        let outputs = predict(model.as_ref(), split, federation.test_batch_size);
        let value = (hook.score)(outputs.view(), split.targets());
        scores.insert(global_score_key(model_name, &hook.split, &hook.name), value);
    }
    Ok(())
}
