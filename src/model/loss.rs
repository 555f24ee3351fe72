use std::fmt;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// A loss function, averaged over the samples of a batch.
pub trait Loss: fmt::Debug + Send + Sync {
    /// Computes the mean loss of the batch and its gradient with respect to the `outputs`.
    ///
    /// `outputs` holds one row per sample, `targets` one entry per sample.
    fn loss_and_grad(&self, outputs: ArrayView2<f64>, targets: ArrayView1<f64>)
        -> (f64, Array2<f64>);

    /// Computes the mean loss of the batch.
    fn loss(&self, outputs: ArrayView2<f64>, targets: ArrayView1<f64>) -> f64 {
        self.loss_and_grad(outputs, targets).0
    }
}

/// Computes the row-wise softmax of `logits`.
pub(crate) fn softmax(logits: ArrayView2<f64>) -> Array2<f64> {
    let mut probs = logits.to_owned();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f64::NEG_INFINITY, |max, x| max.max(*x));
        row.mapv_inplace(|x| (x - max).exp());
        let total = row.sum();
        row /= total;
    }
    probs
}

/// Computes `ln(sum(exp(row)))` without overflow.
fn log_sum_exp(row: ArrayView1<f64>) -> f64 {
    let max = row.fold(f64::NEG_INFINITY, |max, x| max.max(*x));
    max + row.mapv(|x| (x - max).exp()).sum().ln()
}

/// The class index encoded in a target. Targets beyond the last class are clamped to it.
pub(crate) fn class_index(target: f64, num_classes: usize) -> usize {
    (target.max(0.0) as usize).min(num_classes.saturating_sub(1))
}

/// Softmax cross entropy for classification. The targets are class indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

impl Loss for CrossEntropy {
    fn loss_and_grad(
        &self,
        outputs: ArrayView2<f64>,
        targets: ArrayView1<f64>,
    ) -> (f64, Array2<f64>) {
        let batch_size = outputs.nrows().max(1) as f64;
        let num_classes = outputs.ncols();
        let mut grad = softmax(outputs);

        let mut loss = 0.0;
        for ((logits, mut row), target) in outputs
            .axis_iter(Axis(0))
            .zip(grad.axis_iter_mut(Axis(0)))
            .zip(targets.iter())
        {
            let class = class_index(*target, num_classes);
            loss += log_sum_exp(logits) - logits[class];
            row[class] -= 1.0;
        }
        grad /= batch_size;

        (loss / batch_size, grad)
    }
}

/// Mean squared error for regression. Only the first output column is compared to the targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mse;

impl Loss for Mse {
    fn loss_and_grad(
        &self,
        outputs: ArrayView2<f64>,
        targets: ArrayView1<f64>,
    ) -> (f64, Array2<f64>) {
        let batch_size = outputs.nrows().max(1) as f64;
        let mut grad = Array2::zeros(outputs.raw_dim());

        let mut loss = 0.0;
        for ((i, prediction), target) in outputs.column(0).indexed_iter().zip(targets.iter()) {
            let diff = prediction - target;
            loss += diff * diff;
            grad[[i, 0]] = 2.0 * diff / batch_size;
        }

        (loss / batch_size, grad)
    }
}
