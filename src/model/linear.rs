use ndarray::{s, Array1, Array2, ArrayView2, Axis};

use crate::{
    common::Params,
    model::{Model, ModelError},
};

/// A fully connected layer without activation: `outputs = inputs · Wᵀ + b`.
///
/// The flattened parameters are the row-major weights followed by the biases.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    weights: Array2<f64>,
    biases: Array1<f64>,
    d_weights: Array2<f64>,
    d_biases: Array1<f64>,
}

impl Linear {
    /// Creates a zero-initialized linear layer.
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            weights: Array2::zeros((out_features, in_features)),
            biases: Array1::zeros(out_features),
            d_weights: Array2::zeros((out_features, in_features)),
            d_biases: Array1::zeros(out_features),
        }
    }
}

impl Model for Linear {
    fn num_features(&self) -> usize {
        self.weights.ncols()
    }

    fn num_outputs(&self) -> usize {
        self.weights.nrows()
    }

    fn num_parameters(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn parameters(&self) -> Params {
        self.weights.iter().chain(self.biases.iter()).cloned().collect()
    }

    fn set_parameters(&mut self, params: &Params) -> Result<(), ModelError> {
        if params.len() != self.num_parameters() {
            return Err(ModelError::ParameterLength {
                expected: self.num_parameters(),
                found: params.len(),
            });
        }

        let split = self.weights.len();
        let weights = params.slice(s![..split]).into_shape(self.weights.raw_dim())?;
        self.weights.assign(&weights);
        self.biases.assign(&params.slice(s![split..]));
        Ok(())
    }

    fn gradients(&self) -> Params {
        self.d_weights
            .iter()
            .chain(self.d_biases.iter())
            .cloned()
            .collect()
    }

    fn zero_grad(&mut self) {
        self.d_weights.fill(0.0);
        self.d_biases.fill(0.0);
    }

    fn forward(&self, inputs: ArrayView2<f64>) -> Array2<f64> {
        inputs.dot(&self.weights.t()) + &self.biases
    }

    fn backward(&mut self, inputs: ArrayView2<f64>, d_outputs: ArrayView2<f64>) {
        self.d_weights += &d_outputs.t().dot(&inputs);
        self.d_biases += &d_outputs.sum_axis(Axis(0));
    }

    fn boxed_clone(&self) -> Box<dyn Model> {
        Box::new(self.clone())
    }
}
