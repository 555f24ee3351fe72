use crate::{
    common::Params,
    optim::{check_sizes, Optimizer, SizeMismatch},
};

/// Stochastic gradient descent with optional momentum and weight decay.
///
/// With momentum `m`, weight decay `wd` and learning rate `lr`, each step computes
/// `d = g + wd * p`, `buf = m * buf + d` (`buf = d` on the first step) and `p -= lr * buf`.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    velocity: Option<Params>,
}

impl Sgd {
    pub fn new(lr: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocity: None,
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut Params, grads: &Params) -> Result<(), SizeMismatch> {
        check_sizes(params, grads)?;

        let mut direction = grads.clone();
        if self.weight_decay != 0.0 {
            direction.scaled_add(self.weight_decay, params);
        }

        if self.momentum != 0.0 {
            let momentum = self.momentum;
            let velocity = match self.velocity.take() {
                Some(mut velocity) if velocity.len() == direction.len() => {
                    velocity.zip_mut_with(&direction, |v, d| *v = momentum * *v + d);
                    velocity
                }
                _ => direction,
            };
            params.scaled_add(-self.lr, &velocity);
            self.velocity = Some(velocity);
        } else {
            params.scaled_add(-self.lr, &direction);
        }

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
    fn test_plain_step() {
        let mut sgd = Sgd::new(1.0, 0.0, 0.0);
        let mut params = array![1.0, 2.0];
        // a unit step along the pseudo-gradient replaces the parameters
        let target = array![0.5, 0.0];
        let pseudo_grad = &params - &target;
        sgd.step(&mut params, &pseudo_grad).unwrap();
        assert_eq!(params, target);
    }

    #[test]
    fn test_momentum_and_weight_decay() {
        let mut sgd = Sgd::new(0.5, 0.5, 1.0);
        let mut params = array![1.0];

        // d = 1 + 1 = 2, buf = 2, p = 1 - 1 = 0
        sgd.step(&mut params, &array![1.0]).unwrap();
        assert_eq!(params, array![0.0]);

        // d = 1 + 0 = 1, buf = 0.5 * 2 + 1 = 2, p = 0 - 1 = -1
        sgd.step(&mut params, &array![1.0]).unwrap();
        assert_eq!(params, array![-1.0]);
    }

    #[test]
    fn test_size_mismatch() {
        let mut sgd = Sgd::new(0.1, 0.0, 0.0);
        assert_eq!(
            sgd.step(&mut array![1.0, 2.0], &array![1.0]),
            Err(SizeMismatch {
                params: 2,
                grads: 1
            })
        );
    }
}
