//! Optimizer abstractions for parameter updates
//!
//! Optimizers mutate a layer's weights and biases in place from the batch
//! gradients. Variants differ only in the auxiliary per-parameter state
//! they retain between calls; that state is owned exclusively by the
//! optimizer instance and keyed by layer identity, so two layers never
//! share momentum or scaling history.

pub mod adagrad;
pub mod momentum;
pub mod schedule;
pub mod sgd;

pub use adagrad::AdaGrad;
pub use momentum::Momentum;
pub use schedule::LearningRateSchedule;
pub use sgd::Sgd;

use crate::error::{invalid_argument, Result};

/// Core trait for parameter update rules.
///
/// The trainer calls [`update`](Optimizer::update) once per parameter
/// buffer per batch: weights and biases of one layer arrive under distinct
/// keys so stateful optimizers track them independently.
pub trait Optimizer: Send {
    /// Applies one update step in place.
    ///
    /// # Arguments
    ///
    /// * `key` - Stable identity of this parameter buffer across calls
    /// * `parameters` - The buffer to mutate
    /// * `gradients` - Mean gradient of the batch, same length
    /// * `learning_rate` - Step size for this epoch
    /// * `epoch` - Zero-based epoch index
    ///
    /// # Panics
    ///
    /// Implementations panic if `parameters` and `gradients` have
    /// different lengths.
    fn update(
        &mut self,
        key: usize,
        parameters: &mut [f32],
        gradients: &[f32],
        learning_rate: f32,
        epoch: usize,
    );

    /// Clears all accumulated per-parameter state.
    fn reset(&mut self);
}

/// The update rule variants the trainer can build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerAlgorithm {
    /// Plain gradient descent: `p -= lr · g`.
    Sgd,
    /// Gradient descent with velocity: `v = μ·v − lr·g; p += v`.
    Momentum { momentum: f32 },
    /// Adaptive per-parameter scaling from accumulated squared gradients.
    AdaGrad { epsilon: f32 },
}

/// Everything the trainer needs to build and drive an optimizer: the
/// algorithm, the base learning rate, and an optional per-epoch schedule.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub algorithm: OptimizerAlgorithm,
    pub learning_rate: f32,
    pub schedule: LearningRateSchedule,
}

impl OptimizerConfig {
    /// Plain gradient descent at a constant rate.
    pub fn sgd(learning_rate: f32) -> Self {
        Self {
            algorithm: OptimizerAlgorithm::Sgd,
            learning_rate,
            schedule: LearningRateSchedule::Constant,
        }
    }

    /// Momentum descent; `momentum` is typically 0.9.
    pub fn momentum(learning_rate: f32, momentum: f32) -> Self {
        Self {
            algorithm: OptimizerAlgorithm::Momentum { momentum },
            learning_rate,
            schedule: LearningRateSchedule::Constant,
        }
    }

    /// AdaGrad with the customary stability epsilon.
    pub fn adagrad(learning_rate: f32) -> Self {
        Self {
            algorithm: OptimizerAlgorithm::AdaGrad { epsilon: 1e-8 },
            learning_rate,
            schedule: LearningRateSchedule::Constant,
        }
    }

    /// Replaces the learning-rate schedule.
    pub fn with_schedule(mut self, schedule: LearningRateSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Checks the hyperparameters before any training work begins.
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(invalid_argument("learning rate must be positive"));
        }
        match self.algorithm {
            OptimizerAlgorithm::Momentum { momentum } => {
                if !(0.0..1.0).contains(&momentum) {
                    return Err(invalid_argument("momentum must be in [0, 1)"));
                }
            }
            OptimizerAlgorithm::AdaGrad { epsilon } => {
                if !(epsilon > 0.0) {
                    return Err(invalid_argument("adagrad epsilon must be positive"));
                }
            }
            OptimizerAlgorithm::Sgd => {}
        }
        self.schedule.validate()
    }

    /// Instantiates the configured optimizer.
    pub fn build(&self) -> Box<dyn Optimizer> {
        match self.algorithm {
            OptimizerAlgorithm::Sgd => Box::new(Sgd::new()),
            OptimizerAlgorithm::Momentum { momentum } => Box::new(Momentum::new(momentum)),
            OptimizerAlgorithm::AdaGrad { epsilon } => Box::new(AdaGrad::new(epsilon)),
        }
    }

    /// The learning rate the schedule yields for an epoch.
    pub fn learning_rate_for(&self, epoch: usize) -> f32 {
        self.schedule.rate_for(self.learning_rate, epoch)
    }
}
