//! Layer trait definition
//!
//! Every layer kind implements the same three-operation contract: a forward
//! pass producing the pre-activation and activated output, a backward pass
//! producing the delta for the upstream layer, and a side-effect-free
//! gradient computation. Backend selection is orthogonal: a layer is built
//! over an injected [`Backend`](crate::backend::Backend) strategy rather
//! than subclassed per execution mode.

use std::io;

use crate::activations::ActivationKind;
use crate::error::Result;
use crate::tensor::{Tensor, TensorShape};

/// Identifies a concrete layer kind, used as the serialization tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    FullyConnected,
    Convolutional,
    Pooling,
}

impl LayerKind {
    /// Stable numeric tag used by the layer serialization format.
    pub fn tag(self) -> u8 {
        match self {
            LayerKind::FullyConnected => 0,
            LayerKind::Convolutional => 1,
            LayerKind::Pooling => 2,
        }
    }

    /// Reverses [`tag`](LayerKind::tag); unknown tags yield `None`.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(LayerKind::FullyConnected),
            1 => Some(LayerKind::Convolutional),
            2 => Some(LayerKind::Pooling),
            _ => None,
        }
    }
}

/// Weight and bias gradients of one layer for one batch, summed over the
/// batch entities. Lengths always match the layer's weight and bias buffers
/// exactly; parameterless layers return empty gradients.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerGradient {
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
}

impl LayerGradient {
    /// A gradient for a layer with no trainable parameters.
    pub fn empty() -> Self {
        Self {
            weights: Vec::new(),
            biases: Vec::new(),
        }
    }

    /// Scales both gradients in place, used to turn batch sums into means.
    pub fn scale(&mut self, factor: f32) {
        for g in &mut self.weights {
            *g *= factor;
        }
        for g in &mut self.biases {
            *g *= factor;
        }
    }
}

/// Core trait implemented by every layer kind.
///
/// A layer's output shape is a pure function of its input shape and
/// structural parameters, fixed at construction; only the entity count
/// varies between calls. Weights are owned exclusively by the layer and
/// mutated only through [`parameters_mut`](Layer::parameters_mut) by the
/// optimizer.
///
/// Layers are `Send` so a network can move onto a background training
/// thread, but deliberately not `Sync`: the accelerated convolution layer
/// keeps interior-mutable descriptor state, so calls into one layer
/// instance must be serialized by the caller. The trainer's single-threaded
/// loop satisfies this naturally.
pub trait Layer: Send {
    /// The concrete kind of this layer.
    fn kind(&self) -> LayerKind;

    /// Per-entity shape this layer consumes.
    fn input_shape(&self) -> TensorShape;

    /// Per-entity shape this layer produces.
    fn output_shape(&self) -> TensorShape;

    /// The activation function applied to this layer's output.
    fn activation(&self) -> ActivationKind;

    /// Immutable view of the layer's weights (empty for parameterless
    /// layers).
    fn weights(&self) -> &[f32];

    /// Immutable view of the layer's biases.
    fn biases(&self) -> &[f32];

    /// Mutable views of weights and biases, for the optimizer step.
    fn parameters_mut(&mut self) -> (&mut [f32], &mut [f32]);

    /// Total count of trainable parameters.
    fn parameter_count(&self) -> usize {
        self.weights().len() + self.biases().len()
    }

    /// Forward propagation: returns `(pre_activation, activated_output)`.
    ///
    /// Pure with respect to the layer's parameters; the caller retains the
    /// pre-activation for the backward pass.
    fn forward(&self, input: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Backward propagation: computes the error signal for the upstream
    /// layer.
    ///
    /// # Arguments
    ///
    /// * `input` - The input this layer saw during forward
    /// * `delta` - The error delta of this layer's output
    /// * `z_prev` - The upstream layer's pre-activation (input-shaped)
    /// * `f_prev` - The upstream layer's activation function
    ///
    /// The returned delta has this layer's input shape, not its output
    /// shape.
    fn backward(
        &self,
        input: &Tensor,
        delta: &Tensor,
        z_prev: &Tensor,
        f_prev: ActivationKind,
    ) -> Result<Tensor>;

    /// Computes weight and bias gradients from the activated input and this
    /// layer's delta. Side-effect free; gradients are summed over the batch
    /// and match the parameter buffer lengths exactly.
    fn compute_gradient(&self, input: &Tensor, delta: &Tensor) -> Result<LayerGradient>;

    /// Writes the layer's binary representation: input shape, output shape,
    /// activation kind, weight count and values, bias count and values,
    /// then kind-specific structural fields.
    fn serialize(&self, writer: &mut dyn io::Write) -> io::Result<()>;
}
