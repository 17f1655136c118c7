//! Activation functions and their derivatives
//!
//! Activations are a fixed enumeration applied elementwise, either fused
//! into the backend kernels (accelerated path) or as a separate pass
//! (reference path). Both paths evaluate the same scalar functions below,
//! so their results are identical.

/// Slope used by [`ActivationKind::LeakyRelu`] for negative inputs.
const LEAKY_SLOPE: f32 = 0.01;

/// The activation functions supported by the layer kernels.
///
/// Derivatives are expressed in terms of the pre-activation value `z`, which
/// every layer retains from its forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// `f(z) = z`
    Identity,
    /// `f(z) = 1 / (1 + e^-z)`
    Sigmoid,
    /// `f(z) = tanh(z)`
    Tanh,
    /// `f(z) = max(0, z)`
    Relu,
    /// `f(z) = z` for positive `z`, `0.01·z` otherwise
    LeakyRelu,
}

impl ActivationKind {
    /// Applies the activation to a single pre-activation value.
    pub fn apply(self, z: f32) -> f32 {
        match self {
            ActivationKind::Identity => z,
            ActivationKind::Sigmoid => 1.0 / (1.0 + (-z).exp()),
            ActivationKind::Tanh => z.tanh(),
            ActivationKind::Relu => {
                if z > 0.0 {
                    z
                } else {
                    0.0
                }
            }
            ActivationKind::LeakyRelu => {
                if z > 0.0 {
                    z
                } else {
                    LEAKY_SLOPE * z
                }
            }
        }
    }

    /// Evaluates the derivative `f'(z)` at a pre-activation value.
    pub fn derivative(self, z: f32) -> f32 {
        match self {
            ActivationKind::Identity => 1.0,
            ActivationKind::Sigmoid => {
                let s = 1.0 / (1.0 + (-z).exp());
                s * (1.0 - s)
            }
            ActivationKind::Tanh => {
                let t = z.tanh();
                1.0 - t * t
            }
            ActivationKind::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActivationKind::LeakyRelu => {
                if z > 0.0 {
                    1.0
                } else {
                    LEAKY_SLOPE
                }
            }
        }
    }

    /// Stable numeric tag used by the layer serialization format.
    pub fn tag(self) -> u8 {
        match self {
            ActivationKind::Identity => 0,
            ActivationKind::Sigmoid => 1,
            ActivationKind::Tanh => 2,
            ActivationKind::Relu => 3,
            ActivationKind::LeakyRelu => 4,
        }
    }

    /// Reverses [`tag`](ActivationKind::tag); unknown tags yield `None`.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ActivationKind::Identity),
            1 => Some(ActivationKind::Sigmoid),
            2 => Some(ActivationKind::Tanh),
            3 => Some(ActivationKind::Relu),
            4 => Some(ActivationKind::LeakyRelu),
            _ => None,
        }
    }
}
