//! 2D convolutional layer implementation
//!
//! Slides a bank of learnable kernels over the input feature maps, adds a
//! per-output-channel bias, and applies the activation. Output dimensions
//! follow the standard convolution arithmetic
//! `out = floor((in + 2·padding − kernel) / stride) + 1`.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::sync::Arc;

use log::debug;
use rand::rngs::StdRng;
use rand::Rng;

use crate::activations::ActivationKind;
use crate::backend::{Backend, ConvGeometry};
use crate::error::{shape_mismatch, Result};
use crate::layers::serialize::{read_header, read_u32, write_header, write_u32};
use crate::layers::{Layer, LayerGradient, LayerKind};
use crate::tensor::{Tensor, TensorShape};

/// 2D convolutional layer with learnable kernels.
///
/// The kernel geometry descriptor consumed by the backend depends on the
/// batch entity count, so it is cached per layer and rebuilt only when the
/// entity count changes; this interior mutability is what makes a layer
/// instance single-caller. Weights are laid out as
/// `[kernels × in_channels × kernel_height × kernel_width]`.
pub struct ConvolutionalLayer {
    input: TensorShape,
    output: TensorShape,
    kernels: usize,
    kernel_height: usize,
    kernel_width: usize,
    stride: usize,
    padding: usize,
    weights: Vec<f32>,
    biases: Vec<f32>,
    activation: ActivationKind,
    backend: Arc<dyn Backend>,
    descriptor: RefCell<Option<ConvGeometry>>,
}

impl ConvolutionalLayer {
    /// Creates a new convolutional layer with Xavier initialization.
    ///
    /// For convolutions the fan counts are
    /// `fan_in = in_channels × kernel_height × kernel_width` and
    /// `fan_out = kernels × kernel_height × kernel_width`.
    ///
    /// # Errors
    ///
    /// Fails with ShapeMismatch when the kernel does not fit the padded
    /// input or the stride is zero.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: TensorShape,
        kernels: usize,
        kernel_size: (usize, usize),
        stride: usize,
        padding: usize,
        activation: ActivationKind,
        backend: Arc<dyn Backend>,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let (kernel_height, kernel_width) = kernel_size;
        let geometry =
            ConvGeometry::new(input, kernels, kernel_height, kernel_width, stride, padding, 1)?;

        let fan_in = (input.channels * kernel_height * kernel_width) as f32;
        let fan_out = (kernels * kernel_height * kernel_width) as f32;
        let limit = (6.0f32 / (fan_in + fan_out)).sqrt();
        let mut weights = vec![0.0f32; geometry.weight_count()];
        for value in &mut weights {
            *value = rng.gen_range(-limit..limit);
        }

        Ok(Self {
            input,
            output: geometry.output,
            kernels,
            kernel_height,
            kernel_width,
            stride,
            padding,
            weights,
            biases: vec![0.0f32; kernels],
            activation,
            backend,
            descriptor: RefCell::new(None),
        })
    }

    /// Rebuilds a layer from existing parameters, validating their lengths.
    #[allow(clippy::too_many_arguments)]
    pub fn with_parameters(
        input: TensorShape,
        kernels: usize,
        kernel_size: (usize, usize),
        stride: usize,
        padding: usize,
        activation: ActivationKind,
        weights: Vec<f32>,
        biases: Vec<f32>,
        backend: Arc<dyn Backend>,
    ) -> Result<Self> {
        let (kernel_height, kernel_width) = kernel_size;
        let geometry =
            ConvGeometry::new(input, kernels, kernel_height, kernel_width, stride, padding, 1)?;
        if weights.len() != geometry.weight_count() {
            return Err(shape_mismatch(format!(
                "convolutional layer expects {} weights, got {}",
                geometry.weight_count(),
                weights.len()
            )));
        }
        if biases.len() != kernels {
            return Err(shape_mismatch(format!(
                "convolutional layer expects {} biases, got {}",
                kernels,
                biases.len()
            )));
        }
        Ok(Self {
            input,
            output: geometry.output,
            kernels,
            kernel_height,
            kernel_width,
            stride,
            padding,
            weights,
            biases,
            activation,
            backend,
            descriptor: RefCell::new(None),
        })
    }

    /// Number of output kernels (output channels).
    pub fn kernels(&self) -> usize {
        self.kernels
    }

    /// Kernel spatial size as (height, width).
    pub fn kernel_size(&self) -> (usize, usize) {
        (self.kernel_height, self.kernel_width)
    }

    /// Convolution stride.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Zero padding applied symmetrically to every border.
    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Returns the cached geometry descriptor, rebuilding it when the
    /// entity count differs from the last call.
    fn descriptor(&self, entities: usize) -> Result<ConvGeometry> {
        let mut cached = self.descriptor.borrow_mut();
        let stale = !matches!(cached.as_ref(), Some(g) if g.entities == entities);
        if stale {
            debug!(
                "rebuilding convolution descriptor: {} -> {} entities of {}",
                cached.as_ref().map_or(0, |g| g.entities),
                entities,
                self.input
            );
            *cached = Some(ConvGeometry::new(
                self.input,
                self.kernels,
                self.kernel_height,
                self.kernel_width,
                self.stride,
                self.padding,
                entities,
            )?);
        }
        Ok(cached.as_ref().unwrap().clone())
    }

    fn check_input(&self, input: &Tensor) -> Result<()> {
        if input.shape() != self.input {
            return Err(shape_mismatch(format!(
                "convolutional layer takes {} input, got {}",
                self.input,
                input.shape()
            )));
        }
        Ok(())
    }

    /// Tries to read a convolutional layer from the stream; `None` on any
    /// short or inconsistent read.
    pub fn deserialize(reader: &mut dyn Read, backend: Arc<dyn Backend>) -> Option<Self> {
        let header = read_header(reader)?;
        let kernels = read_u32(reader)? as usize;
        let kernel_height = read_u32(reader)? as usize;
        let kernel_width = read_u32(reader)? as usize;
        let stride = read_u32(reader)? as usize;
        let padding = read_u32(reader)? as usize;
        let layer = Self::with_parameters(
            header.input,
            kernels,
            (kernel_height, kernel_width),
            stride,
            padding,
            header.activation,
            header.weights,
            header.biases,
            backend,
        )
        .ok()?;
        // The serialized output shape must agree with the recomputed one.
        if layer.output != header.output {
            return None;
        }
        Some(layer)
    }
}

impl Layer for ConvolutionalLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Convolutional
    }

    fn input_shape(&self) -> TensorShape {
        self.input
    }

    fn output_shape(&self) -> TensorShape {
        self.output
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
        let geometry = self.descriptor(input.entities())?;
        let mut z = Tensor::zeroed(self.output, input.entities());
        let mut a = Tensor::zeroed(self.output, input.entities());
        self.backend.conv_forward(
            &geometry,
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
        let geometry = self.descriptor(delta.entities())?;
        let mut out = Tensor::zeroed(self.input, delta.entities());
        self.backend.conv_backward(
            &geometry,
            delta.data(),
            &self.weights,
            z_prev.data(),
            f_prev,
            out.data_mut(),
        )?;
        Ok(out)
    }

    fn compute_gradient(&self, input: &Tensor, delta: &Tensor) -> Result<LayerGradient> {
        self.check_input(input)?;
        let geometry = self.descriptor(delta.entities())?;
        let mut gradient = LayerGradient {
            weights: vec![0.0f32; self.weights.len()],
            biases: vec![0.0f32; self.biases.len()],
        };
        self.backend.conv_gradient(
            &geometry,
            input.data(),
            delta.data(),
            &mut gradient.weights,
            &mut gradient.biases,
        )?;
        Ok(gradient)
    }

    fn serialize(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        write_header(writer, self)?;
        write_u32(writer, self.kernels as u32)?;
        write_u32(writer, self.kernel_height as u32)?;
        write_u32(writer, self.kernel_width as u32)?;
        write_u32(writer, self.stride as u32)?;
        write_u32(writer, self.padding as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn backend() -> Arc<dyn Backend> {
        Arc::new(crate::backend::ReferenceBackend::new())
    }

    fn layer(
        input: TensorShape,
        kernels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> ConvolutionalLayer {
        let mut rng = StdRng::seed_from_u64(42);
        ConvolutionalLayer::new(
            input,
            kernels,
            (kernel, kernel),
            stride,
            padding,
            ActivationKind::Identity,
            backend(),
            &mut rng,
        )
        .unwrap()
    }

    #[test]
    fn test_output_shape_same_convolution() {
        // padding = kernel / 2 with stride 1 preserves the spatial size
        let layer = layer(TensorShape::new(1, 28, 28), 8, 3, 1, 1);
        assert_eq!(layer.output_shape(), TensorShape::new(8, 28, 28));
    }

    #[test]
    fn test_output_shape_valid_convolution() {
        let layer = layer(TensorShape::new(1, 28, 28), 8, 3, 1, 0);
        assert_eq!(layer.output_shape(), TensorShape::new(8, 26, 26));
    }

    #[test]
    fn test_output_shape_strided() {
        let layer = layer(TensorShape::new(3, 32, 32), 16, 5, 2, 0);
        // (32 - 5) / 2 + 1 = 14
        assert_eq!(layer.output_shape(), TensorShape::new(16, 14, 14));
    }

    #[test]
    fn test_parameter_count() {
        let layer = layer(TensorShape::new(1, 28, 28), 8, 3, 1, 1);
        // 8 kernels of 1x3x3 plus 8 biases
        assert_eq!(layer.parameter_count(), 80);
    }

    #[test]
    fn test_oversized_kernel_is_rejected() {
        let mut rng = StdRng::seed_from_u64(42);
        let result = ConvolutionalLayer::new(
            TensorShape::new(1, 3, 3),
            2,
            (5, 5),
            1,
            0,
            ActivationKind::Identity,
            backend(),
            &mut rng,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_descriptor_rebuilds_on_entity_change() {
        let layer = layer(TensorShape::new(1, 8, 8), 2, 3, 1, 1);

        let input4 = Tensor::zeroed(TensorShape::new(1, 8, 8), 4);
        layer.forward(&input4).unwrap();
        assert_eq!(layer.descriptor.borrow().as_ref().unwrap().entities, 4);

        // Same entity count reuses the descriptor; a new count rebuilds it.
        layer.forward(&input4).unwrap();
        assert_eq!(layer.descriptor.borrow().as_ref().unwrap().entities, 4);

        let input2 = Tensor::zeroed(TensorShape::new(1, 8, 8), 2);
        layer.forward(&input2).unwrap();
        assert_eq!(layer.descriptor.borrow().as_ref().unwrap().entities, 2);
    }

    #[test]
    fn test_forward_rejects_wrong_shape() {
        let layer = layer(TensorShape::new(1, 8, 8), 2, 3, 1, 1);
        let input = Tensor::zeroed(TensorShape::new(2, 8, 8), 1);
        assert!(layer.forward(&input).is_err());
    }

    #[test]
    fn test_gradient_shapes_match_parameters() {
        let layer = layer(TensorShape::new(2, 6, 6), 3, 3, 1, 0);
        let input = Tensor::zeroed(TensorShape::new(2, 6, 6), 2);
        let delta = Tensor::zeroed(layer.output_shape(), 2);
        let gradient = layer.compute_gradient(&input, &delta).unwrap();
        assert_eq!(gradient.weights.len(), layer.weights().len());
        assert_eq!(gradient.biases.len(), 3);
    }
}
