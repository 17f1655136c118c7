//! AdaGrad: adaptive per-parameter scaling
//!
//! Accumulates the squared gradient of every parameter and divides each
//! step by its root: `acc += g²; p -= lr · g / (sqrt(acc) + ε)`.
//! Frequently-updated parameters see their effective rate shrink while
//! rarely-updated ones keep taking full steps.

use std::collections::HashMap;

use crate::optimizers::Optimizer;

/// AdaGrad with per-buffer accumulators.
#[derive(Debug)]
pub struct AdaGrad {
    epsilon: f32,
    accumulators: HashMap<usize, Vec<f32>>,
}

impl AdaGrad {
    /// Creates an AdaGrad optimizer; `epsilon` guards the division,
    /// typically 1e-8.
    pub fn new(epsilon: f32) -> Self {
        Self {
            epsilon,
            accumulators: HashMap::new(),
        }
    }
}

impl Optimizer for AdaGrad {
    fn update(
        &mut self,
        key: usize,
        parameters: &mut [f32],
        gradients: &[f32],
        learning_rate: f32,
        _epoch: usize,
    ) {
        assert_eq!(
            parameters.len(),
            gradients.len(),
            "parameters and gradients must have the same length"
        );
        let acc = self
            .accumulators
            .entry(key)
            .or_insert_with(|| vec![0.0f32; parameters.len()]);
        debug_assert_eq!(acc.len(), parameters.len(), "accumulator length drifted");

        for ((param, &grad), acc) in parameters.iter_mut().zip(gradients).zip(acc.iter_mut()) {
            *acc += grad * grad;
            *param -= learning_rate * grad / (acc.sqrt() + self.epsilon);
        }
    }

    fn reset(&mut self) {
        self.accumulators.clear();
    }
}
