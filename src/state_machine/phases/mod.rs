//! This module provides the `PhaseStates` of the [`StateMachine`].
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

mod aggregation;
mod client_selection;
mod done;
mod evaluation;
mod failure;
mod global_update;
mod idle;
mod local_training;
mod phase;
mod round_end;
mod round_start;

pub use self::{
    aggregation::Aggregation,
    client_selection::ClientSelection,
    done::Done,
    evaluation::Evaluation,
    failure::{Failure, PhaseError},
    global_update::GlobalUpdate,
    idle::Idle,
    local_training::LocalTraining,
    phase::{Federation, Phase, PhaseName, PhaseState, Shared},
    round_end::RoundEnd,
    round_start::RoundStart,
};
