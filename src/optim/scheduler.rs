use std::fmt;

/// Schedules a learning rate.
pub trait LrScheduler: fmt::Debug + Send + Sync {
    /// Advances the schedule by one step and returns the new learning rate.
    fn step(&mut self) -> f64;

    /// Gets the current learning rate.
    fn lr(&self) -> f64;

    /// Creates a fresh schedule starting at `base_lr`.
    fn with_base_lr(&self, base_lr: f64) -> Box<dyn LrScheduler>;
}

/// Decays the learning rate by `gamma` every `step_size` steps.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLr {
    base_lr: f64,
    step_size: u64,
    gamma: f64,
    steps: u64,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: u64, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            steps: 0,
        }
    }
}

impl LrScheduler for StepLr {
    fn step(&mut self) -> f64 {
        self.steps += 1;
        self.lr()
    }

    fn lr(&self) -> f64 {
        let decays = (self.steps / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    fn with_base_lr(&self, base_lr: f64) -> Box<dyn LrScheduler> {
        Box::new(StepLr::new(base_lr, self.step_size, self.gamma))
    }
}

/// Keeps the learning rate constant.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantLr {
    lr: f64,
}

impl ConstantLr {
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }
}

impl LrScheduler for ConstantLr {
    fn step(&mut self) -> f64 {
        self.lr
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn with_base_lr(&self, base_lr: f64) -> Box<dyn LrScheduler> {
        Box::new(ConstantLr::new(base_lr))
    }
}
