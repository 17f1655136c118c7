//! Max-pooling layer implementation
//!
//! Downsamples each channel independently by taking the maximum over a
//! square window. Pooling has no trainable parameters; its backward pass
//! routes each upstream delta to the position that produced the window
//! maximum.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::activations::ActivationKind;
use crate::backend::{Backend, PoolGeometry};
use crate::error::{shape_mismatch, Result};
use crate::layers::serialize::{read_header, read_u32, write_header, write_u32};
use crate::layers::{Layer, LayerGradient, LayerKind};
use crate::tensor::{Tensor, TensorShape};

/// Max-pooling layer over square windows, without padding.
pub struct PoolingLayer {
    input: TensorShape,
    output: TensorShape,
    window: usize,
    stride: usize,
    activation: ActivationKind,
    backend: Arc<dyn Backend>,
    // Empty parameter buffers so the trait's mutable views have a target.
    weights: Vec<f32>,
    biases: Vec<f32>,
}

impl PoolingLayer {
    /// Creates a pooling layer; `window` and `stride` of 2 halve each
    /// spatial dimension.
    pub fn new(
        input: TensorShape,
        window: usize,
        stride: usize,
        activation: ActivationKind,
        backend: Arc<dyn Backend>,
    ) -> Result<Self> {
        let geometry = PoolGeometry::new(input, window, stride, 1)?;
        Ok(Self {
            input,
            output: geometry.output,
            window,
            stride,
            activation,
            backend,
            weights: Vec::new(),
            biases: Vec::new(),
        })
    }

    /// Pooling window edge length.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Pooling stride.
    pub fn stride(&self) -> usize {
        self.stride
    }

    fn geometry(&self, entities: usize) -> Result<PoolGeometry> {
        PoolGeometry::new(self.input, self.window, self.stride, entities)
    }

    fn check_input(&self, input: &Tensor) -> Result<()> {
        if input.shape() != self.input {
            return Err(shape_mismatch(format!(
                "pooling layer takes {} input, got {}",
                self.input,
                input.shape()
            )));
        }
        Ok(())
    }

    /// Tries to read a pooling layer from the stream; `None` on any short
    /// or inconsistent read.
    pub fn deserialize(reader: &mut dyn Read, backend: Arc<dyn Backend>) -> Option<Self> {
        let header = read_header(reader)?;
        if !header.weights.is_empty() || !header.biases.is_empty() {
            return None;
        }
        let window = read_u32(reader)? as usize;
        let stride = read_u32(reader)? as usize;
        let layer =
            Self::new(header.input, window, stride, header.activation, backend).ok()?;
        if layer.output != header.output {
            return None;
        }
        Some(layer)
    }
}

impl Layer for PoolingLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Pooling
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
        let geometry = self.geometry(input.entities())?;
        let mut z = Tensor::zeroed(self.output, input.entities());
        self.backend.pool_forward(&geometry, input.data(), z.data_mut())?;
        let mut a = Tensor::zeroed(self.output, input.entities());
        self.backend
            .activation_forward(z.data(), a.data_mut(), self.activation)?;
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
        let geometry = self.geometry(delta.entities())?;
        let mut out = Tensor::zeroed(self.input, delta.entities());
        self.backend.pool_backward(
            &geometry,
            input.data(),
            delta.data(),
            z_prev.data(),
            f_prev,
            out.data_mut(),
        )?;
        Ok(out)
    }

    fn compute_gradient(&self, _input: &Tensor, _delta: &Tensor) -> Result<LayerGradient> {
        Ok(LayerGradient::empty())
    }

    fn serialize(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        write_header(writer, self)?;
        write_u32(writer, self.window as u32)?;
        write_u32(writer, self.stride as u32)
    }
}
