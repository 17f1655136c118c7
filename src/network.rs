//! Sequential network composition
//!
//! A [`SequentialNetwork`] owns an ordered sequence of layers whose shapes
//! are validated once at construction. Forward propagation threads a tensor
//! through every layer while retaining each pre-activation and activated
//! output in a caller-owned [`ForwardTrace`]; the backward pass walks the
//! trace in reverse, producing one gradient pair per layer.

use std::io::{Read, Write};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

use crate::backend::Backend;
use crate::cost::CostKind;
use crate::dataset::BatchSource;
use crate::error::{invalid_argument, shape_mismatch, Result};
use crate::layers::serialize::{read_layer, read_u32, read_u8, write_layer, write_u32, write_u8};
use crate::layers::{Layer, LayerGradient, LayerKind};
use crate::progress::Evaluation;
use crate::tensor::{Tensor, TensorPool, TensorShape};

/// Per-layer artifacts retained by a training-mode forward pass.
struct TraceStep {
    /// Pre-activation output of the layer.
    z: Tensor,
    /// Activated (and possibly dropout-masked) output of the layer.
    a: Tensor,
    /// Inverted-dropout mask applied to `a`, when one was drawn.
    mask: Option<Vec<f32>>,
}

/// The scratch list a training forward pass hands to the backward pass.
///
/// Owned by the caller of [`SequentialNetwork::forward_train`]; release it
/// into a [`TensorPool`] once the batch's gradients have been consumed.
pub struct ForwardTrace {
    steps: Vec<TraceStep>,
}

impl ForwardTrace {
    /// The network's final activated output for this pass.
    pub fn output(&self) -> &Tensor {
        &self.steps.last().expect("trace of a non-empty network").a
    }

    /// Returns every retained tensor to the pool.
    pub fn recycle(self, pool: &mut TensorPool) {
        for step in self.steps {
            pool.release(step.z);
            pool.release(step.a);
        }
    }
}

/// An ordered, shape-checked sequence of layers with a cost function.
pub struct SequentialNetwork {
    layers: Vec<Box<dyn Layer>>,
    cost: CostKind,
}

impl std::fmt::Debug for SequentialNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialNetwork")
            .field("layers", &self.layers.len())
            .field("cost", &self.cost)
            .finish()
    }
}

impl SequentialNetwork {
    /// Composes layers into a network.
    ///
    /// # Errors
    ///
    /// * InvalidArgument when no layers are given.
    /// * ShapeMismatch when any adjacent pair disagrees: spatial layers
    ///   (convolution, pooling) require the exact upstream shape, fully
    ///   connected layers accept any upstream shape of the right total size
    ///   (implicit flattening).
    pub fn new(layers: Vec<Box<dyn Layer>>, cost: CostKind) -> Result<Self> {
        if layers.is_empty() {
            return Err(invalid_argument("a network needs at least one layer"));
        }
        for i in 0..layers.len() - 1 {
            let produced = layers[i].output_shape();
            let consumed = layers[i + 1].input_shape();
            let compatible = match layers[i + 1].kind() {
                LayerKind::Convolutional | LayerKind::Pooling => produced == consumed,
                LayerKind::FullyConnected => produced.size() == consumed.size(),
            };
            if !compatible {
                return Err(shape_mismatch(format!(
                    "layer {} produces {} but layer {} consumes {}",
                    i,
                    produced,
                    i + 1,
                    consumed
                )));
            }
        }
        Ok(Self { layers, cost })
    }

    /// The layers in forward order.
    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    /// Number of layers.
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// The cost function used for training and evaluation.
    pub fn cost(&self) -> CostKind {
        self.cost
    }

    /// Per-entity shape consumed by the first layer.
    pub fn input_shape(&self) -> TensorShape {
        self.layers[0].input_shape()
    }

    /// Per-entity shape produced by the last layer.
    pub fn output_shape(&self) -> TensorShape {
        self.layers[self.layers.len() - 1].output_shape()
    }

    /// Total trainable parameters across all layers.
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.parameter_count()).sum()
    }

    /// Mutable weight and bias views of one layer, for the optimizer step.
    pub fn layer_parameters_mut(&mut self, index: usize) -> (&mut [f32], &mut [f32]) {
        self.layers[index].parameters_mut()
    }

    fn check_batch(&self, input: &Tensor) -> Result<()> {
        if input.shape().size() != self.input_shape().size() {
            return Err(shape_mismatch(format!(
                "batch entities of {} do not fit the network input {}",
                input.shape(),
                self.input_shape()
            )));
        }
        Ok(())
    }

    /// Inference forward pass: threads the input through every layer and
    /// returns the final activated output. No dropout, nothing retained.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.check_batch(input)?;
        let mut current: Option<Tensor> = None;
        for layer in &self.layers {
            let (_, a) = layer.forward(current.as_ref().unwrap_or(input))?;
            current = Some(a);
        }
        Ok(current.expect("network has at least one layer"))
    }

    /// Training forward pass: retains every layer's pre-activation and
    /// activated output, and applies inverted-dropout masks to fully
    /// connected activations (all but the output layer) when
    /// `dropout > 0`.
    pub fn forward_train(
        &self,
        input: &Tensor,
        dropout: f32,
        rng: &mut StdRng,
    ) -> Result<ForwardTrace> {
        self.check_batch(input)?;
        let last = self.layers.len() - 1;
        let mut steps: Vec<TraceStep> = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let layer_input = steps.last().map_or(input, |step| &step.a);
            let (z, mut a) = layer.forward(layer_input)?;
            let mask = if dropout > 0.0
                && i < last
                && layer.kind() == LayerKind::FullyConnected
            {
                let scale = 1.0 / (1.0 - dropout);
                let mask: Vec<f32> = (0..a.len())
                    .map(|_| if rng.gen::<f32>() < dropout { 0.0 } else { scale })
                    .collect();
                for (value, &m) in a.data_mut().iter_mut().zip(&mask) {
                    *value *= m;
                }
                Some(mask)
            } else {
                None
            };
            steps.push(TraceStep { z, a, mask });
        }
        Ok(ForwardTrace { steps })
    }

    /// Backward pass over a retained trace: computes the output delta from
    /// the cost derivative, then walks the layers in reverse calling each
    /// layer's `backward` and `compute_gradient`.
    ///
    /// Returns one gradient pair per layer, in forward order, summed over
    /// the batch.
    pub fn backward(
        &self,
        trace: &ForwardTrace,
        input: &Tensor,
        expected: &Tensor,
    ) -> Result<Vec<LayerGradient>> {
        let output = trace.output();
        if expected.shape().size() != output.shape().size()
            || expected.entities() != output.entities()
        {
            return Err(shape_mismatch(format!(
                "expected output of {} entities of {} against network output of {} entities of {}",
                expected.entities(),
                expected.shape(),
                output.entities(),
                output.shape()
            )));
        }

        let last = self.layers.len() - 1;
        let last_step = &trace.steps[last];
        let mut delta = self.cost.output_delta(
            &last_step.a,
            expected,
            &last_step.z,
            self.layers[last].activation(),
        );

        let mut gradients: Vec<LayerGradient> = Vec::with_capacity(self.layers.len());
        for l in (0..self.layers.len()).rev() {
            let layer_input = if l == 0 { input } else { &trace.steps[l - 1].a };
            gradients.push(self.layers[l].compute_gradient(layer_input, &delta)?);
            if l > 0 {
                let upstream = &trace.steps[l - 1];
                let mut down = self.layers[l].backward(
                    layer_input,
                    &delta,
                    &upstream.z,
                    self.layers[l - 1].activation(),
                )?;
                // A dropped activation contributes no gradient either.
                if let Some(mask) = &upstream.mask {
                    for (d, &m) in down.data_mut().iter_mut().zip(mask) {
                        *d *= m;
                    }
                }
                delta = down;
            }
        }
        gradients.reverse();
        Ok(gradients)
    }

    /// Scores the network over a dataset: mean cost per entity and argmax
    /// classification accuracy.
    pub fn evaluate(&self, set: &dyn BatchSource) -> Result<Evaluation> {
        let mut cost_sum = 0.0f32;
        let mut correct = 0usize;
        let mut total = 0usize;
        for (input, expected) in set.batches() {
            let output = self.forward(&input)?;
            cost_sum += self.cost.value(&output, &expected) * input.entities() as f32;
            for e in 0..input.entities() {
                if argmax(output.entity(e)) == argmax(expected.entity(e)) {
                    correct += 1;
                }
            }
            total += input.entities();
        }
        if total == 0 {
            return Err(invalid_argument("cannot evaluate over an empty dataset"));
        }
        Ok(Evaluation {
            cost: cost_sum / total as f32,
            accuracy: correct as f32 / total as f32,
        })
    }

    /// Writes the whole network: cost tag, layer count, then one framed
    /// layer record per layer.
    pub fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        write_u8(writer, self.cost.tag())?;
        write_u32(writer, self.layers.len() as u32)?;
        for layer in &self.layers {
            write_layer(writer, layer.as_ref())?;
        }
        Ok(())
    }

    /// Reads a network written by [`save`](SequentialNetwork::save).
    /// Returns `None` when the stream ends before a full network is read.
    pub fn load(reader: &mut dyn Read, backend: &Arc<dyn Backend>) -> Option<Self> {
        let cost = CostKind::from_tag(read_u8(reader)?)?;
        let count = read_u32(reader)? as usize;
        let mut layers = Vec::with_capacity(count.min(1 << 10));
        for _ in 0..count {
            layers.push(read_layer(reader, backend)?);
        }
        Self::new(layers, cost).ok()
    }
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    for (i, &value) in values.iter().enumerate() {
        if value > values[best] {
            best = i;
        }
    }
    best
}
