//! Federation state and run parameter types.

use serde::{Deserialize, Serialize};

use crate::settings::{FederationSettings, SummarySettings};

/// The federation state.
///
/// Everything the coordinator tracks across rounds besides the stores and components, i.e. the
/// parameters of the run and the progress made so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationState {
    /// The current round. `0` before the first round started.
    pub round_id: u64,
    /// The number of rounds to run.
    pub rounds: u64,
    /// The seed of the run.
    pub seed: u64,
    /// The gap in rounds between two evaluations of the global scores.
    pub log_freq: u64,
    /// The initial learning rate of the client optimizers in the current round.
    pub local_lr: f64,
    /// Whether the early stop condition was reached.
    pub stopped_early: bool,
}

impl FederationState {
    /// Creates a new federation state.
    pub fn new(federation: &FederationSettings, summary: &SummarySettings, local_lr: f64) -> Self {
        Self {
            round_id: 0,
            rounds: federation.rounds,
            seed: federation.seed,
            log_freq: summary.log_freq,
            local_lr,
            stopped_early: false,
        }
    }

    /// Checks whether the global scores are evaluated in the current round.
    pub fn is_evaluation_round(&self) -> bool {
        self.log_freq > 0 && self.round_id % self.log_freq == 0
    }

    /// Checks whether the run is over after the current round.
    pub fn is_last_round(&self) -> bool {
        self.stopped_early || self.round_id >= self.rounds
    }
}
