//! Fully connected layer implementation
//!
//! Performs the transformation `y = f(x·W + b)` where x is the input
//! (entities × input_size), W is the weight matrix (input_size ×
//! output_size) in row-major order, and b is the bias vector.

use std::io::{Read, Write};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

use crate::activations::ActivationKind;
use crate::backend::{Backend, DenseDims};
use crate::error::{shape_mismatch, Result};
use crate::layers::serialize::{read_header, write_header};
use crate::layers::{Layer, LayerGradient, LayerKind};
use crate::tensor::{Tensor, TensorShape};

/// Fully connected layer with weights and biases.
///
/// The weight matrix has shape `[input_size × output_size]`; a batch of
/// size 1 is as valid as any other. The compute backend is injected at
/// construction and shared between layers.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rand::{rngs::StdRng, SeedableRng};
/// use tensornet::{ActivationKind, DenseLayer, Layer, ReferenceBackend};
///
/// let backend = Arc::new(ReferenceBackend::new());
/// let mut rng = StdRng::seed_from_u64(42);
/// let layer = DenseLayer::new(784, 128, ActivationKind::Sigmoid, backend, &mut rng);
/// assert_eq!(layer.parameter_count(), 784 * 128 + 128);
/// ```
pub struct DenseLayer {
    input_size: usize,
    output_size: usize,
    weights: Vec<f32>,
    biases: Vec<f32>,
    activation: ActivationKind,
    backend: Arc<dyn Backend>,
}

impl DenseLayer {
    /// Creates a new fully connected layer with Xavier initialization.
    ///
    /// Weights are sampled uniformly from `[-limit, limit]` with
    /// `limit = sqrt(6 / (input_size + output_size))`; biases start at zero.
    pub fn new(
        input_size: usize,
        output_size: usize,
        activation: ActivationKind,
        backend: Arc<dyn Backend>,
        rng: &mut StdRng,
    ) -> Self {
        let limit = (6.0f32 / (input_size + output_size) as f32).sqrt();
        let mut weights = vec![0.0f32; input_size * output_size];
        for value in &mut weights {
            *value = rng.gen_range(-limit..limit);
        }

        Self {
            input_size,
            output_size,
            weights,
            biases: vec![0.0f32; output_size],
            activation,
            backend,
        }
    }

    /// Rebuilds a layer from existing parameters, validating their lengths.
    pub fn with_parameters(
        input_size: usize,
        output_size: usize,
        activation: ActivationKind,
        weights: Vec<f32>,
        biases: Vec<f32>,
        backend: Arc<dyn Backend>,
    ) -> Result<Self> {
        if weights.len() != input_size * output_size {
            return Err(shape_mismatch(format!(
                "dense layer expects {} weights, got {}",
                input_size * output_size,
                weights.len()
            )));
        }
        if biases.len() != output_size {
            return Err(shape_mismatch(format!(
                "dense layer expects {} biases, got {}",
                output_size,
                biases.len()
            )));
        }
        Ok(Self {
            input_size,
            output_size,
            weights,
            biases,
            activation,
            backend,
        })
    }

    /// Number of input features per entity.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Number of output features per entity.
    pub fn output_size(&self) -> usize {
        self.output_size
    }

    fn dims(&self, entities: usize) -> DenseDims {
        DenseDims {
            entities,
            inputs: self.input_size,
            outputs: self.output_size,
        }
    }

    fn check_input(&self, input: &Tensor) -> Result<()> {
        if input.shape().size() != self.input_size {
            return Err(shape_mismatch(format!(
                "dense layer takes {} features per entity, got {}",
                self.input_size,
                input.shape().size()
            )));
        }
        Ok(())
    }

    /// Tries to read a fully connected layer from the stream; `None` on any
    /// short or inconsistent read.
    pub fn deserialize(reader: &mut dyn Read, backend: Arc<dyn Backend>) -> Option<Self> {
        let header = read_header(reader)?;
        Self::with_parameters(
            header.input.size(),
            header.output.size(),
            header.activation,
            header.weights,
            header.biases,
            backend,
        )
        .ok()
    }
}

impl Layer for DenseLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::FullyConnected
    }

    fn input_shape(&self) -> TensorShape {
        TensorShape::linear(self.input_size)
    }

    fn output_shape(&self) -> TensorShape {
        TensorShape::linear(self.output_size)
    }

    fn activation(&self) -> ActivationKind {
        self.activation
    }

    fn weights(&self) -> &[f32] {
        &self.weights
    }

    fn biases(&self) -> &[f32] {
        &self.biases
    }

    fn parameters_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.weights, &mut self.biases)
    }

    fn forward(&self, input: &Tensor) -> Result<(Tensor, Tensor)> {
        self.check_input(input)?;
        let entities = input.entities();
        let mut z = Tensor::zeroed(self.output_shape(), entities);
        let mut a = Tensor::zeroed(self.output_shape(), entities);
        self.backend.dense_forward(
            self.dims(entities),
            input.data(),
            &self.weights,
            &self.biases,
            z.data_mut(),
            a.data_mut(),
            self.activation,
        )?;
        Ok((z, a))
    }

    fn backward(
        &self,
        input: &Tensor,
        delta: &Tensor,
        z_prev: &Tensor,
        f_prev: ActivationKind,
    ) -> Result<Tensor> {
        self.check_input(input)?;
        let entities = delta.entities();
        let mut out = Tensor::zeroed(self.input_shape(), entities);
        self.backend.dense_backward(
            self.dims(entities),
            z_prev.data(),
            delta.data(),
            &self.weights,
            f_prev,
            out.data_mut(),
        )?;
        Ok(out)
    }

    fn compute_gradient(&self, input: &Tensor, delta: &Tensor) -> Result<LayerGradient> {
        self.check_input(input)?;
        let mut gradient = LayerGradient {
            weights: vec![0.0f32; self.weights.len()],
            biases: vec![0.0f32; self.biases.len()],
        };
        self.backend.dense_gradient(
            self.dims(delta.entities()),
            input.data(),
            delta.data(),
            &mut gradient.weights,
            &mut gradient.biases,
        )?;
        Ok(gradient)
    }

    fn serialize(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        // No structural fields beyond the shared header: the sizes are the
        // shapes.
        write_header(writer, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn backend() -> Arc<dyn Backend> {
        Arc::new(crate::backend::ReferenceBackend::new())
    }

    #[test]
    fn test_layer_creation() {
        let mut rng = StdRng::seed_from_u64(42);
        let layer = DenseLayer::new(10, 5, ActivationKind::Sigmoid, backend(), &mut rng);

        assert_eq!(layer.input_size(), 10);
        assert_eq!(layer.output_size(), 5);
        assert_eq!(layer.weights().len(), 50);
        assert_eq!(layer.biases().len(), 5);
        assert_eq!(layer.parameter_count(), 55);
    }

    #[test]
    fn test_xavier_initialization_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let layer = DenseLayer::new(100, 50, ActivationKind::Relu, backend(), &mut rng);

        let limit = (6.0f32 / 150.0).sqrt();
        for &weight in layer.weights() {
            assert!(
                weight >= -limit && weight <= limit,
                "weight {} outside Xavier range [{}, {}]",
                weight,
                -limit,
                limit
            );
        }
        for &bias in layer.biases() {
            assert_eq!(bias, 0.0);
        }
    }

    #[test]
    fn test_deterministic_initialization() {
        let mut rng1 = StdRng::seed_from_u64(42);
        let layer1 = DenseLayer::new(10, 5, ActivationKind::Sigmoid, backend(), &mut rng1);
        let mut rng2 = StdRng::seed_from_u64(42);
        let layer2 = DenseLayer::new(10, 5, ActivationKind::Sigmoid, backend(), &mut rng2);

        assert_eq!(layer1.weights(), layer2.weights());
        assert_eq!(layer1.biases(), layer2.biases());
    }

    #[test]
    fn test_forward_batch_of_one() {
        let layer = DenseLayer::with_parameters(
            2,
            1,
            ActivationKind::Identity,
            vec![2.0, 3.0],
            vec![0.5],
            backend(),
        )
        .unwrap();
        let input = Tensor::from_vec(TensorShape::linear(2), 1, vec![1.0, 1.0]).unwrap();
        let (z, a) = layer.forward(&input).unwrap();
        assert_eq!(z.data(), &[5.5]);
        assert_eq!(a.data(), &[5.5]);
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = DenseLayer::new(4, 2, ActivationKind::Identity, backend(), &mut rng);
        let input = Tensor::zeroed(TensorShape::linear(3), 1);
        assert!(layer.forward(&input).is_err());
    }

    #[test]
    fn test_forward_does_not_mutate_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = DenseLayer::new(6, 3, ActivationKind::Tanh, backend(), &mut rng);
        let snapshot = layer.weights().to_vec();
        let input = Tensor::zeroed(TensorShape::linear(6), 4);
        layer.forward(&input).unwrap();
        assert_eq!(layer.weights(), snapshot.as_slice());
    }

    #[test]
    fn test_gradient_shapes_match_parameters() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = DenseLayer::new(5, 4, ActivationKind::Sigmoid, backend(), &mut rng);
        let input = Tensor::zeroed(TensorShape::linear(5), 2);
        let delta = Tensor::zeroed(TensorShape::linear(4), 2);
        let gradient = layer.compute_gradient(&input, &delta).unwrap();
        assert_eq!(gradient.weights.len(), layer.weights().len());
        assert_eq!(gradient.biases.len(), layer.biases().len());
    }

    #[test]
    fn test_with_parameters_validates_lengths() {
        assert!(DenseLayer::with_parameters(
            3,
            2,
            ActivationKind::Identity,
            vec![0.0; 5],
            vec![0.0; 2],
            backend()
        )
        .is_err());
    }
}
