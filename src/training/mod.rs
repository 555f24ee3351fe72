//! Local training of client models.
//!
//! The [`LocalTrainer`] runs a fixed number of epochs over a client's training split in shuffled
//! mini-batches. Each step zeroes the gradients, runs the forward pass, the loss and the backward
//! pass, hands the gradients to a [`GradTransform`] and finally lets the optimizer update the
//! parameters.

use ndarray::{s, Array2};
use rand::{seq::SliceRandom, Rng};
use thiserror::Error;
use tracing::trace;

use crate::{
    common::{ClientId, Params},
    data::Dataset,
    model::{Loss, Model, ModelError},
    optim::{LrScheduler, Optimizer, SizeMismatch},
};

/// Errors of the local training.
#[derive(Debug, Error, PartialEq)]
pub enum TrainingError {
    #[error("numeric divergence of client {client_id} in epoch {epoch}, step {step}: the {quantity} is not finite")]
    NumericDivergence {
        client_id: ClientId,
        epoch: usize,
        step: usize,
        quantity: &'static str,
    },

    #[error("optimizer failed: {0}")]
    Optimizer(#[from] SizeMismatch),

    #[error("model failed: {0}")]
    Model(#[from] ModelError),
}

/// A hook which may modify the gradients of every step before the optimizer applies them.
///
/// The algorithms use it to add their regularization terms. Any `Fn(&Params, &mut Params)`
/// closure is a transform, where the first argument holds the parameters of the current step.
pub trait GradTransform: Sync {
    fn transform_grads(&self, params: &Params, grads: &mut Params);
}

impl<F> GradTransform for F
where
    F: Fn(&Params, &mut Params) + Sync,
{
    fn transform_grads(&self, params: &Params, grads: &mut Params) {
        self(params, grads)
    }
}

/// Leaves the gradients untouched.
pub fn no_transform(_params: &Params, _grads: &mut Params) {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The training loop parameters.
pub struct TrainingConfig {
    /// The number of passes over the training split.
    pub epochs: usize,
    /// The maximal number of samples per step.
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// The summary of a local training.
pub struct TrainingOutcome {
    /// The number of samples seen over all epochs.
    pub num_samples: usize,
    /// The number of optimization steps.
    pub num_steps: usize,
    /// The mean training loss over all steps, if any step was taken.
    pub mean_loss: Option<f64>,
}

/// Runs the local optimization of one client.
#[derive(Debug)]
pub struct LocalTrainer<'a> {
    pub client_id: ClientId,
    pub loss: &'a dyn Loss,
    pub optimizer: Box<dyn Optimizer>,
    /// Steps once per epoch and sets the learning rate of the optimizer.
    pub scheduler: Option<Box<dyn LrScheduler>>,
    pub config: TrainingConfig,
}

impl<'a> LocalTrainer<'a> {
    /// Trains `model` on `data`.
    ///
    /// The model keeps the trained parameters. With zero epochs or empty data the parameters stay
    /// unchanged.
    ///
    /// # Errors
    /// Fails with [`TrainingError::NumericDivergence`] as soon as the loss or the parameters
    /// stop being finite.
    pub fn train<R: Rng>(
        &mut self,
        model: &mut dyn Model,
        data: &Dataset,
        transform: &dyn GradTransform,
        rng: &mut R,
    ) -> Result<TrainingOutcome, TrainingError> {
        let client_id = self.client_id;
        let batch_size = self.config.batch_size.max(1);
        let mut params = model.parameters();
        let mut indices: Vec<usize> = (0..data.len()).collect();

        let mut num_samples = 0;
        let mut num_steps = 0;
        let mut total_loss = 0.0;

        for epoch in 1..=self.config.epochs {
            indices.shuffle(rng);
            for (step, batch) in indices.chunks(batch_size).enumerate() {
                let step = step + 1;
                let (inputs, targets) = data.select(batch);

                model.zero_grad();
                let outputs = model.forward(inputs.view());
                let (loss, d_outputs) = self.loss.loss_and_grad(outputs.view(), targets.view());
                if !loss.is_finite() {
                    return Err(TrainingError::NumericDivergence {
                        client_id,
                        epoch,
                        step,
                        quantity: "loss",
                    });
                }
                model.backward(inputs.view(), d_outputs.view());

                let mut grads = model.gradients();
                transform.transform_grads(&params, &mut grads);
                self.optimizer.step(&mut params, &grads)?;
                if !params.iter().all(|p| p.is_finite()) {
                    return Err(TrainingError::NumericDivergence {
                        client_id,
                        epoch,
                        step,
                        quantity: "parameter vector",
                    });
                }
                model.set_parameters(&params)?;

                num_samples += batch.len();
                num_steps += 1;
                total_loss += loss;
            }

            if let Some(scheduler) = self.scheduler.as_mut() {
                self.optimizer.set_lr(scheduler.step());
            }
            trace!(client_id, epoch, lr = self.optimizer.lr(), "finished epoch");
        }

        Ok(TrainingOutcome {
            num_samples,
            num_steps,
            mean_loss: if num_steps > 0 {
                Some(total_loss / num_steps as f64)
            } else {
                None
            },
        })
    }
}

/// Computes the outputs of `model` for every sample of `data`, `batch_size` samples at a time.
pub fn predict(model: &dyn Model, data: &Dataset, batch_size: usize) -> Array2<f64> {
    let mut outputs = Array2::zeros((data.len(), model.num_outputs()));
    let mut start = 0;
    for (inputs, _) in data.batches(batch_size) {
        let end = start + inputs.nrows();
        outputs
            .slice_mut(s![start..end, ..])
            .assign(&model.forward(inputs));
        start = end;
    }
    outputs
}
