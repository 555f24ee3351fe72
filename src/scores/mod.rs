//! Scores: evaluation functions, their registration against data splits and the windowed
//! summary of the reported values.

mod hooks;
mod summary;

use std::sync::Arc;

use ndarray::{ArrayView1, ArrayView2, Axis};

pub use self::{
    hooks::{global_score_key, local_score_key, ScoreHook, ScoreHooks},
    summary::ScoreSummary,
};
use crate::{
    data::argmax,
    model::{CrossEntropy, Loss, Mse},
};

/// A score function mapping the outputs of a model (one row per sample) and the targets to a
/// single number.
pub type ScoreFn = Arc<dyn Fn(ArrayView2<f64>, ArrayView1<f64>) -> f64 + Send + Sync>;

/// The share of samples whose highest output is the target class.
pub fn accuracy(outputs: ArrayView2<f64>, targets: ArrayView1<f64>) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let hits = outputs
        .axis_iter(Axis(0))
        .zip(targets.iter())
        .filter(|(row, target)| argmax(row.iter()) as f64 == **target)
        .count();
    hits as f64 / targets.len() as f64
}

/// The mean softmax cross entropy.
pub fn cross_entropy(outputs: ArrayView2<f64>, targets: ArrayView1<f64>) -> f64 {
    CrossEntropy.loss(outputs, targets)
}

/// The mean squared error of the first output.
pub fn mse(outputs: ArrayView2<f64>, targets: ArrayView1<f64>) -> f64 {
    Mse.loss(outputs, targets)
}
