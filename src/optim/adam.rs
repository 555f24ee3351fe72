use crate::{
    common::Params,
    optim::{check_sizes, Optimizer, SizeMismatch},
};

/// The Adam optimizer with bias correction and optional (L2) weight decay.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    weight_decay: f64,
    beta1_t: f64,
    beta2_t: f64,
    moments: Option<(Params, Params)>,
}

impl Adam {
    pub fn new(lr: f64, beta1: f64, beta2: f64, epsilon: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            beta1_t: 1.0,
            beta2_t: 1.0,
            moments: None,
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut Params, grads: &Params) -> Result<(), SizeMismatch> {
        check_sizes(params, grads)?;

        let Self {
            lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            weight_decay: wd,
            ..
        } = *self;

        let (mut m, mut v) = match self.moments.take() {
            Some((m, v)) if m.len() == params.len() => (m, v),
            _ => (Params::zeros(params.len()), Params::zeros(params.len())),
        };

        self.beta1_t *= b1;
        self.beta2_t *= b2;
        let bc1 = 1.0 - self.beta1_t;
        let bc2 = 1.0 - self.beta2_t;

        for (((p, g), m), v) in params
            .iter_mut()
            .zip(grads.iter())
            .zip(m.iter_mut())
            .zip(v.iter_mut())
        {
            let g = g + wd * *p;
            *m = b1 * *m + (1.0 - b1) * g;
            *v = b2 * *v + (1.0 - b2) * g * g;
            *p -= lr * (*m / bc1) / ((*v / bc2).sqrt() + eps);
        }

        self.moments = Some((m, v));
        Ok(())
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn boxed_clone(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_first_step_moves_by_lr() {
        // the bias corrected first step is `lr * sign(g)` up to epsilon
        let mut adam = Adam::new(0.1, 0.9, 0.999, 1e-8, 0.0);
        let mut params = array![1.0, -1.0];
        adam.step(&mut params, &array![3.0, -0.5]).unwrap();

        assert!((params[0] - 0.9).abs() < 1e-6);
        assert!((params[1] + 0.9).abs() < 1e-6);
    }
}
