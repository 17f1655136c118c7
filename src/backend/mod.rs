//! Compute backends for layer kernels
//!
//! Every layer kind delegates its arithmetic to a [`Backend`]: the
//! [`ReferenceBackend`] runs plain sequential loops and serves as the
//! semantics oracle, while the [`AcceleratedBackend`] dispatches the same
//! per-element computations as a grid of independent tasks over blocked
//! matrix kernels. Backend selection is a constructor argument of each
//! layer, orthogonal to the layer kind, so the two axes never multiply into
//! subclasses.
//!
//! For identical inputs, weights and activation, the two backends agree on
//! forward outputs, backward deltas and gradients within a relative
//! tolerance of about 1e-4; they are not bit-exact because the accelerated
//! kernels reorder floating point sums.

mod accelerated;
mod reference;

pub use accelerated::{AcceleratedBackend, DeviceContext};
pub use reference::ReferenceBackend;

use crate::activations::ActivationKind;
use crate::error::{shape_mismatch, Result};
use crate::tensor::TensorShape;

/// Computes one output dimension of a strided, padded convolution:
/// `floor((input + 2·padding − kernel) / stride) + 1`.
///
/// Fails when the padded input is smaller than the kernel or the stride is
/// zero.
///
/// # Example
///
/// ```
/// use tensornet::backend::conv_output_dim;
///
/// assert_eq!(conv_output_dim(28, 3, 1, 0).unwrap(), 26);
/// assert_eq!(conv_output_dim(28, 3, 1, 1).unwrap(), 28);
/// assert_eq!(conv_output_dim(28, 3, 2, 0).unwrap(), 13);
/// ```
pub fn conv_output_dim(input: usize, kernel: usize, stride: usize, padding: usize) -> Result<usize> {
    if stride == 0 {
        return Err(shape_mismatch("convolution stride must be at least 1"));
    }
    if kernel == 0 {
        return Err(shape_mismatch("convolution kernel must be at least 1"));
    }
    let padded = input + 2 * padding;
    if padded < kernel {
        return Err(shape_mismatch(format!(
            "kernel {} does not fit padded input {}",
            kernel, padded
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

/// Batch dimensions of a fully connected kernel call.
#[derive(Debug, Clone, Copy)]
pub struct DenseDims {
    /// Number of entities in the batch.
    pub entities: usize,
    /// Input features per entity.
    pub inputs: usize,
    /// Output features per entity.
    pub outputs: usize,
}

/// Shape descriptor for a convolution call.
///
/// The spatial fields are fixed by the layer's structural parameters; the
/// entity count varies per batch, which is why accelerated convolution
/// layers cache and rebuild this descriptor when the batch size changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvGeometry {
    pub entities: usize,
    pub input: TensorShape,
    pub output: TensorShape,
    pub kernel_height: usize,
    pub kernel_width: usize,
    /// Number of output kernels (output channels).
    pub kernels: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvGeometry {
    /// Derives the full geometry from the structural parameters, validating
    /// that the kernel fits the padded input.
    pub fn new(
        input: TensorShape,
        kernels: usize,
        kernel_height: usize,
        kernel_width: usize,
        stride: usize,
        padding: usize,
        entities: usize,
    ) -> Result<Self> {
        if kernels == 0 {
            return Err(shape_mismatch("convolution needs at least one kernel"));
        }
        let out_height = conv_output_dim(input.height, kernel_height, stride, padding)?;
        let out_width = conv_output_dim(input.width, kernel_width, stride, padding)?;
        Ok(Self {
            entities,
            input,
            output: TensorShape::new(kernels, out_height, out_width),
            kernel_height,
            kernel_width,
            kernels,
            stride,
            padding,
        })
    }

    /// Padded height of one input channel.
    pub fn padded_height(&self) -> usize {
        self.input.height + 2 * self.padding
    }

    /// Padded width of one input channel.
    pub fn padded_width(&self) -> usize {
        self.input.width + 2 * self.padding
    }

    /// Length of the layer's weight buffer:
    /// kernels × channels × kernel_height × kernel_width.
    pub fn weight_count(&self) -> usize {
        self.kernels * self.input.channels * self.kernel_height * self.kernel_width
    }

    /// Size of the padded-input workspace the accelerated kernels stage into.
    pub fn workspace_len(&self) -> usize {
        self.entities * self.input.channels * self.padded_height() * self.padded_width()
    }
}

/// Shape descriptor for a max-pooling call. Pooling windows never pad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolGeometry {
    pub entities: usize,
    pub input: TensorShape,
    pub output: TensorShape,
    pub window: usize,
    pub stride: usize,
}

impl PoolGeometry {
    /// Derives the pooled output shape from the window and stride.
    pub fn new(input: TensorShape, window: usize, stride: usize, entities: usize) -> Result<Self> {
        let out_height = conv_output_dim(input.height, window, stride, 0)?;
        let out_width = conv_output_dim(input.width, window, stride, 0)?;
        Ok(Self {
            entities,
            input,
            output: TensorShape::new(input.channels, out_height, out_width),
            window,
            stride,
        })
    }
}

/// The kernel surface shared by both backends.
///
/// Buffer arguments are flat row-major slices whose lengths are fixed by the
/// accompanying dimension descriptor; callers (the layers) validate tensor
/// shapes before dispatching. Kernels only fail on the accelerated path,
/// when a device buffer cannot be acquired.
pub trait Backend: Send + Sync {
    /// Short human-readable backend name for logs.
    fn name(&self) -> &'static str;

    /// `a[i] = f(z[i])` over the whole buffer.
    fn activation_forward(&self, z: &[f32], a: &mut [f32], f: ActivationKind) -> Result<()>;

    /// `delta[i] *= f'(z[i])` over the whole buffer.
    fn activation_backward(&self, z: &[f32], delta: &mut [f32], f: ActivationKind) -> Result<()>;

    /// Fully connected forward: `z = x·W + b`, `a = f(z)`.
    ///
    /// `x` is entities × inputs, `w` is inputs × outputs, `b` has one value
    /// per output feature.
    fn dense_forward(
        &self,
        dims: DenseDims,
        x: &[f32],
        w: &[f32],
        b: &[f32],
        z: &mut [f32],
        a: &mut [f32],
        f: ActivationKind,
    ) -> Result<()>;

    /// Fully connected backward data pass:
    /// `out = (dy · Wᵀ) ⊙ f'(z_prev)`.
    ///
    /// `z_prev` and `out` have the layer's input layout (entities × inputs);
    /// `f_prev` is the activation of the upstream layer.
    fn dense_backward(
        &self,
        dims: DenseDims,
        z_prev: &[f32],
        dy: &[f32],
        w: &[f32],
        f_prev: ActivationKind,
        out: &mut [f32],
    ) -> Result<()>;

    /// Fully connected gradients: `dw = xᵀ·dy`, `db = column sums of dy`,
    /// both summed over the batch.
    fn dense_gradient(
        &self,
        dims: DenseDims,
        x: &[f32],
        dy: &[f32],
        dw: &mut [f32],
        db: &mut [f32],
    ) -> Result<()>;

    /// Convolution forward: cross-correlation of `x` with the kernel bank
    /// `w`, one bias per output channel, then `a = f(z)`.
    fn conv_forward(
        &self,
        geometry: &ConvGeometry,
        x: &[f32],
        w: &[f32],
        b: &[f32],
        z: &mut [f32],
        a: &mut [f32],
        f: ActivationKind,
    ) -> Result<()>;

    /// Convolution backward data pass: full correlation of `dy` with the
    /// transposed kernel bank, then the elementwise product with
    /// `f'(z_prev)`. `out` has the layer's input layout.
    fn conv_backward(
        &self,
        geometry: &ConvGeometry,
        dy: &[f32],
        w: &[f32],
        z_prev: &[f32],
        f_prev: ActivationKind,
        out: &mut [f32],
    ) -> Result<()>;

    /// Convolution gradients accumulated over all batch entities.
    fn conv_gradient(
        &self,
        geometry: &ConvGeometry,
        x: &[f32],
        dy: &[f32],
        dw: &mut [f32],
        db: &mut [f32],
    ) -> Result<()>;

    /// Max-pooling forward.
    fn pool_forward(&self, geometry: &PoolGeometry, x: &[f32], out: &mut [f32]) -> Result<()>;

    /// Max-pooling backward: routes each upstream delta to the argmax
    /// position of its window, then applies `f'(z_prev)`.
    fn pool_backward(
        &self,
        geometry: &PoolGeometry,
        x: &[f32],
        dy: &[f32],
        z_prev: &[f32],
        f_prev: ActivationKind,
        out: &mut [f32],
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_dim_boundary_cases() {
        // p = 0, s = 1: plain valid convolution
        assert_eq!(conv_output_dim(28, 3, 1, 0).unwrap(), 26);
        assert_eq!(conv_output_dim(5, 5, 1, 0).unwrap(), 1);
        // p = k / 2, s = 1: same-size convolution for odd kernels
        assert_eq!(conv_output_dim(28, 3, 1, 1).unwrap(), 28);
        assert_eq!(conv_output_dim(17, 5, 1, 2).unwrap(), 17);
        // s > 1: strided downsampling, flooring the division
        assert_eq!(conv_output_dim(28, 3, 2, 0).unwrap(), 13);
        assert_eq!(conv_output_dim(7, 2, 2, 0).unwrap(), 3);
        assert_eq!(conv_output_dim(28, 2, 2, 0).unwrap(), 14);
    }

    #[test]
    fn test_output_dim_rejects_oversized_kernel() {
        assert!(conv_output_dim(3, 5, 1, 0).is_err());
        // Padding can make the kernel fit again.
        assert!(conv_output_dim(3, 5, 1, 1).is_ok());
    }

    #[test]
    fn test_output_dim_rejects_zero_stride() {
        assert!(conv_output_dim(28, 3, 0, 0).is_err());
    }

    #[test]
    fn test_conv_geometry() {
        let g = ConvGeometry::new(TensorShape::new(3, 28, 28), 8, 3, 3, 1, 1, 16).unwrap();
        assert_eq!(g.output, TensorShape::new(8, 28, 28));
        assert_eq!(g.weight_count(), 8 * 3 * 3 * 3);
        assert_eq!(g.padded_height(), 30);
        assert_eq!(g.workspace_len(), 16 * 3 * 30 * 30);
    }

    #[test]
    fn test_pool_geometry() {
        let g = PoolGeometry::new(TensorShape::new(4, 28, 28), 2, 2, 8).unwrap();
        assert_eq!(g.output, TensorShape::new(4, 14, 14));
    }
}
