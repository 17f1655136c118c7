//! Cost functions for network training
//!
//! A cost function contributes two things to the training loop: a scalar
//! batch cost for progress reporting and convergence checks, and the
//! output-layer delta that seeds backpropagation.

use crate::activations::ActivationKind;
use crate::tensor::Tensor;

/// Floor used when clamping cross-entropy probabilities away from 0 and 1.
const CROSS_ENTROPY_CLAMP: f32 = 1e-7;

/// The cost functions supported by [`SequentialNetwork`](crate::SequentialNetwork).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostKind {
    /// Half sum of squared errors, averaged over the batch.
    Quadratic,
    /// Binary cross-entropy, averaged over the batch. The output delta is
    /// computed fused with the output activation, so it pairs with sigmoid
    /// outputs.
    CrossEntropy,
}

impl CostKind {
    /// Mean cost per entity for a batch of outputs against expected values.
    pub fn value(self, outputs: &Tensor, expected: &Tensor) -> f32 {
        debug_assert_eq!(outputs.len(), expected.len(), "cost value length mismatch");
        let n = outputs.entities().max(1) as f32;
        let total: f32 = match self {
            CostKind::Quadratic => outputs
                .data()
                .iter()
                .zip(expected.data())
                .map(|(&a, &y)| {
                    let d = a - y;
                    0.5 * d * d
                })
                .sum(),
            CostKind::CrossEntropy => outputs
                .data()
                .iter()
                .zip(expected.data())
                .map(|(&a, &y)| {
                    let a = a.clamp(CROSS_ENTROPY_CLAMP, 1.0 - CROSS_ENTROPY_CLAMP);
                    -(y * a.ln() + (1.0 - y) * (1.0 - a).ln())
                })
                .sum(),
        };
        total / n
    }

    /// Delta of the output layer: the derivative of the cost with respect to
    /// the output pre-activation.
    ///
    /// For the quadratic cost this is `(a − y) ⊙ f'(z)`. For cross-entropy
    /// the activation derivative cancels against the cost derivative and the
    /// delta is simply `a − y`.
    pub fn output_delta(
        self,
        outputs: &Tensor,
        expected: &Tensor,
        pre_activation: &Tensor,
        activation: ActivationKind,
    ) -> Tensor {
        debug_assert_eq!(outputs.len(), expected.len(), "output delta length mismatch");
        let mut delta = Tensor::zeroed(outputs.shape(), outputs.entities());
        match self {
            CostKind::Quadratic => {
                for (((d, &a), &y), &z) in delta
                    .data_mut()
                    .iter_mut()
                    .zip(outputs.data())
                    .zip(expected.data())
                    .zip(pre_activation.data())
                {
                    *d = (a - y) * activation.derivative(z);
                }
            }
            CostKind::CrossEntropy => {
                for ((d, &a), &y) in delta
                    .data_mut()
                    .iter_mut()
                    .zip(outputs.data())
                    .zip(expected.data())
                {
                    *d = a - y;
                }
            }
        }
        delta
    }

    /// Stable numeric tag used by the network serialization format.
    pub fn tag(self) -> u8 {
        match self {
            CostKind::Quadratic => 0,
            CostKind::CrossEntropy => 1,
        }
    }

    /// Reverses [`tag`](CostKind::tag); unknown tags yield `None`.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CostKind::Quadratic),
            1 => Some(CostKind::CrossEntropy),
            _ => None,
        }
    }
}
