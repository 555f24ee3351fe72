//! Optimizers and learning rate schedulers.
//!
//! The same implementations serve both sides of the federation: the local optimizers update the
//! client models during the local training and the server optimizer applies the aggregated
//! pseudo-gradient to the global parameters.

mod adam;
mod scheduler;
mod sgd;

use std::fmt;

use thiserror::Error;

pub use self::{
    adam::Adam,
    scheduler::{ConstantLr, LrScheduler, StepLr},
    sgd::Sgd,
};
use crate::common::Params;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("size mismatch: {params} parameters but {grads} gradients")]
/// Error returned when the parameters and the gradients differ in length.
pub struct SizeMismatch {
    pub params: usize,
    pub grads: usize,
}

/// Defines the strategy for updating parameters based on their gradients.
pub trait Optimizer: fmt::Debug + Send + Sync {
    /// Updates `params` in place with the `grads`.
    ///
    /// # Errors
    /// Fails if `params` and `grads` differ in length.
    fn step(&mut self, params: &mut Params, grads: &Params) -> Result<(), SizeMismatch>;

    /// Gets the current learning rate.
    fn lr(&self) -> f64;

    /// Sets the learning rate used by the next steps.
    fn set_lr(&mut self, lr: f64);

    /// Creates a copy of this optimizer.
    fn boxed_clone(&self) -> Box<dyn Optimizer>;
}

pub(crate) fn check_sizes(params: &Params, grads: &Params) -> Result<(), SizeMismatch> {
    if params.len() == grads.len() {
        Ok(())
    } else {
        Err(SizeMismatch {
            params: params.len(),
            grads: grads.len(),
        })
    }
}
