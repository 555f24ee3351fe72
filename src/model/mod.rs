//! Models and losses consumed by the local training.
//!
//! The federation only ever handles flattened parameter vectors. A [`Model`] converts between
//! that representation and whatever structure it needs for its forward and backward passes.

mod linear;
mod loss;

use std::fmt;

use ndarray::{Array2, ArrayView2, ShapeError};
use thiserror::Error;

pub use self::{
    linear::Linear,
    loss::{CrossEntropy, Loss, Mse},
};
use crate::common::Params;

/// Errors of a [`Model`].
#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("expected {expected} parameters but got {found}")]
    ParameterLength { expected: usize, found: usize },

    #[error("invalid parameter shape: {0}")]
    Shape(#[from] ShapeError),
}

/// A differentiable model with a flattened parameter vector.
pub trait Model: fmt::Debug + Send + Sync {
    /// Gets the number of input features.
    fn num_features(&self) -> usize;

    /// Gets the number of outputs per sample.
    fn num_outputs(&self) -> usize;

    /// Gets the number of parameters.
    fn num_parameters(&self) -> usize;

    /// Gets a copy of the flattened parameters.
    fn parameters(&self) -> Params;

    /// Overwrites the parameters with the flattened `params`.
    ///
    /// # Errors
    /// Fails if `params` doesn't have [`Model::num_parameters()`] entries.
    fn set_parameters(&mut self, params: &Params) -> Result<(), ModelError>;

    /// Gets a copy of the flattened gradients accumulated since the last
    /// [`Model::zero_grad()`].
    fn gradients(&self) -> Params;

    /// Resets the accumulated gradients.
    fn zero_grad(&mut self);

    /// Computes the outputs (one row per sample) for the `inputs` (one row per sample).
    fn forward(&self, inputs: ArrayView2<f64>) -> Array2<f64>;

    /// Accumulates the gradients of the loss, given the `inputs` of the forward pass and the
    /// gradient of the loss with respect to the outputs.
    fn backward(&mut self, inputs: ArrayView2<f64>, d_outputs: ArrayView2<f64>);

    /// Creates an independent copy of this model.
    fn boxed_clone(&self) -> Box<dyn Model>;
}
