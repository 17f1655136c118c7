//! Sequential reference backend
//!
//! Plain loops with no dependencies and no internal state. Every kernel here
//! is the semantics oracle that the accelerated backend is tested against.

use crate::activations::ActivationKind;
use crate::backend::{Backend, ConvGeometry, DenseDims, PoolGeometry};
use crate::error::Result;

/// The sequential CPU backend.
#[derive(Debug, Default)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn activation_forward(&self, z: &[f32], a: &mut [f32], f: ActivationKind) -> Result<()> {
        debug_assert_eq!(z.len(), a.len(), "activation buffer length mismatch");
        for (a, &z) in a.iter_mut().zip(z) {
            *a = f.apply(z);
        }
        Ok(())
    }

    fn activation_backward(&self, z: &[f32], delta: &mut [f32], f: ActivationKind) -> Result<()> {
        debug_assert_eq!(z.len(), delta.len(), "activation buffer length mismatch");
        for (d, &z) in delta.iter_mut().zip(z) {
            *d *= f.derivative(z);
        }
        Ok(())
    }

    fn dense_forward(
        &self,
        dims: DenseDims,
        x: &[f32],
        w: &[f32],
        b: &[f32],
        z: &mut [f32],
        a: &mut [f32],
        f: ActivationKind,
    ) -> Result<()> {
        let (n, l, k) = (dims.entities, dims.inputs, dims.outputs);
        debug_assert_eq!(x.len(), n * l);
        debug_assert_eq!(w.len(), l * k);
        debug_assert_eq!(z.len(), n * k);

        for i in 0..n {
            let row = &x[i * l..(i + 1) * l];
            for j in 0..k {
                let mut sum = b[j];
                for (t, &value) in row.iter().enumerate() {
                    sum += value * w[t * k + j];
                }
                z[i * k + j] = sum;
                a[i * k + j] = f.apply(sum);
            }
        }
        Ok(())
    }

    fn dense_backward(
        &self,
        dims: DenseDims,
        z_prev: &[f32],
        dy: &[f32],
        w: &[f32],
        f_prev: ActivationKind,
        out: &mut [f32],
    ) -> Result<()> {
        let (n, l, k) = (dims.entities, dims.inputs, dims.outputs);
        debug_assert_eq!(dy.len(), n * k);
        debug_assert_eq!(out.len(), n * l);
        debug_assert_eq!(z_prev.len(), n * l);

        // out = (dy · Wᵀ) ⊙ f'(z_prev); W is read transposed in place.
        for i in 0..n {
            for j in 0..l {
                let mut sum = 0.0f32;
                let dy_offset = i * k;
                let w_offset = j * k;
                for m in 0..k {
                    sum += dy[dy_offset + m] * w[w_offset + m];
                }
                let idx = i * l + j;
                out[idx] = f_prev.derivative(z_prev[idx]) * sum;
            }
        }
        Ok(())
    }

    fn dense_gradient(
        &self,
        dims: DenseDims,
        x: &[f32],
        dy: &[f32],
        dw: &mut [f32],
        db: &mut [f32],
    ) -> Result<()> {
        let (n, l, k) = (dims.entities, dims.inputs, dims.outputs);
        debug_assert_eq!(dw.len(), l * k);
        debug_assert_eq!(db.len(), k);

        for i in 0..l {
            for j in 0..k {
                let mut sum = 0.0f32;
                for e in 0..n {
                    sum += x[e * l + i] * dy[e * k + j];
                }
                dw[i * k + j] = sum;
            }
        }
        for (j, db) in db.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for e in 0..n {
                sum += dy[e * k + j];
            }
            *db = sum;
        }
        Ok(())
    }

    fn conv_forward(
        &self,
        g: &ConvGeometry,
        x: &[f32],
        w: &[f32],
        b: &[f32],
        z: &mut [f32],
        a: &mut [f32],
        f: ActivationKind,
    ) -> Result<()> {
        let (ih, iw) = (g.input.height as isize, g.input.width as isize);
        let channels = g.input.channels;
        let (oh, ow) = (g.output.height, g.output.width);
        let in_size = g.input.size();
        let out_size = g.output.size();
        debug_assert_eq!(x.len(), g.entities * in_size);
        debug_assert_eq!(w.len(), g.weight_count());
        debug_assert_eq!(z.len(), g.entities * out_size);

        for e in 0..g.entities {
            for oc in 0..g.kernels {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut sum = b[oc];
                        for ic in 0..channels {
                            for ky in 0..g.kernel_height {
                                for kx in 0..g.kernel_width {
                                    let iy = (oy * g.stride + ky) as isize - g.padding as isize;
                                    let ix = (ox * g.stride + kx) as isize - g.padding as isize;
                                    if iy < 0 || iy >= ih || ix < 0 || ix >= iw {
                                        continue;
                                    }
                                    let x_idx = e * in_size
                                        + (ic * g.input.height + iy as usize) * g.input.width
                                        + ix as usize;
                                    let w_idx = ((oc * channels + ic) * g.kernel_height + ky)
                                        * g.kernel_width
                                        + kx;
                                    sum += x[x_idx] * w[w_idx];
                                }
                            }
                        }
                        let idx = e * out_size + (oc * oh + oy) * ow + ox;
                        z[idx] = sum;
                        a[idx] = f.apply(sum);
                    }
                }
            }
        }
        Ok(())
    }

    fn conv_backward(
        &self,
        g: &ConvGeometry,
        dy: &[f32],
        w: &[f32],
        z_prev: &[f32],
        f_prev: ActivationKind,
        out: &mut [f32],
    ) -> Result<()> {
        let channels = g.input.channels;
        let (oh, ow) = (g.output.height, g.output.width);
        let in_size = g.input.size();
        let out_size = g.output.size();
        debug_assert_eq!(dy.len(), g.entities * out_size);
        debug_assert_eq!(out.len(), g.entities * in_size);
        debug_assert_eq!(z_prev.len(), g.entities * in_size);

        // Each input position gathers from every output position whose
        // receptive field covers it; the kernel is read transposed.
        for e in 0..g.entities {
            for ic in 0..channels {
                for iy in 0..g.input.height {
                    for ix in 0..g.input.width {
                        let mut sum = 0.0f32;
                        for oc in 0..g.kernels {
                            for ky in 0..g.kernel_height {
                                for kx in 0..g.kernel_width {
                                    let ty = iy + g.padding;
                                    let tx = ix + g.padding;
                                    if ty < ky || tx < kx {
                                        continue;
                                    }
                                    let (ty, tx) = (ty - ky, tx - kx);
                                    if ty % g.stride != 0 || tx % g.stride != 0 {
                                        continue;
                                    }
                                    let (oy, ox) = (ty / g.stride, tx / g.stride);
                                    if oy >= oh || ox >= ow {
                                        continue;
                                    }
                                    let dy_idx = e * out_size + (oc * oh + oy) * ow + ox;
                                    let w_idx = ((oc * channels + ic) * g.kernel_height + ky)
                                        * g.kernel_width
                                        + kx;
                                    sum += dy[dy_idx] * w[w_idx];
                                }
                            }
                        }
                        let idx =
                            e * in_size + (ic * g.input.height + iy) * g.input.width + ix;
                        out[idx] = f_prev.derivative(z_prev[idx]) * sum;
                    }
                }
            }
        }
        Ok(())
    }

    fn conv_gradient(
        &self,
        g: &ConvGeometry,
        x: &[f32],
        dy: &[f32],
        dw: &mut [f32],
        db: &mut [f32],
    ) -> Result<()> {
        let (ih, iw) = (g.input.height as isize, g.input.width as isize);
        let channels = g.input.channels;
        let (oh, ow) = (g.output.height, g.output.width);
        let in_size = g.input.size();
        let out_size = g.output.size();
        debug_assert_eq!(dw.len(), g.weight_count());
        debug_assert_eq!(db.len(), g.kernels);

        dw.fill(0.0);
        for oc in 0..g.kernels {
            for ic in 0..channels {
                for ky in 0..g.kernel_height {
                    for kx in 0..g.kernel_width {
                        let mut sum = 0.0f32;
                        for e in 0..g.entities {
                            for oy in 0..oh {
                                for ox in 0..ow {
                                    let iy = (oy * g.stride + ky) as isize - g.padding as isize;
                                    let ix = (ox * g.stride + kx) as isize - g.padding as isize;
                                    if iy < 0 || iy >= ih || ix < 0 || ix >= iw {
                                        continue;
                                    }
                                    let x_idx = e * in_size
                                        + (ic * g.input.height + iy as usize) * g.input.width
                                        + ix as usize;
                                    let dy_idx = e * out_size + (oc * oh + oy) * ow + ox;
                                    sum += x[x_idx] * dy[dy_idx];
                                }
                            }
                        }
                        dw[((oc * channels + ic) * g.kernel_height + ky) * g.kernel_width + kx] =
                            sum;
                    }
                }
            }
        }

        for (oc, db) in db.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for e in 0..g.entities {
                let offset = e * out_size + oc * oh * ow;
                for &d in &dy[offset..offset + oh * ow] {
                    sum += d;
                }
            }
            *db = sum;
        }
        Ok(())
    }

    fn pool_forward(&self, g: &PoolGeometry, x: &[f32], out: &mut [f32]) -> Result<()> {
        let (oh, ow) = (g.output.height, g.output.width);
        let plane = g.input.height * g.input.width;
        let out_plane = oh * ow;
        let planes = g.entities * g.input.channels;
        debug_assert_eq!(x.len(), planes * plane);
        debug_assert_eq!(out.len(), planes * out_plane);

        for p in 0..planes {
            let src = &x[p * plane..(p + 1) * plane];
            let dst = &mut out[p * out_plane..(p + 1) * out_plane];
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut best = f32::NEG_INFINITY;
                    for wy in 0..g.window {
                        for wx in 0..g.window {
                            let value =
                                src[(oy * g.stride + wy) * g.input.width + ox * g.stride + wx];
                            if value > best {
                                best = value;
                            }
                        }
                    }
                    dst[oy * ow + ox] = best;
                }
            }
        }
        Ok(())
    }

    fn pool_backward(
        &self,
        g: &PoolGeometry,
        x: &[f32],
        dy: &[f32],
        z_prev: &[f32],
        f_prev: ActivationKind,
        out: &mut [f32],
    ) -> Result<()> {
        let (oh, ow) = (g.output.height, g.output.width);
        let plane = g.input.height * g.input.width;
        let out_plane = oh * ow;
        let planes = g.entities * g.input.channels;
        debug_assert_eq!(out.len(), planes * plane);
        debug_assert_eq!(z_prev.len(), planes * plane);

        out.fill(0.0);
        for p in 0..planes {
            let src = &x[p * plane..(p + 1) * plane];
            let deltas = &dy[p * out_plane..(p + 1) * out_plane];
            let dst = &mut out[p * plane..(p + 1) * plane];
            for oy in 0..oh {
                for ox in 0..ow {
                    // Route the delta to the window's argmax position.
                    let mut best = f32::NEG_INFINITY;
                    let mut best_idx = 0usize;
                    for wy in 0..g.window {
                        for wx in 0..g.window {
                            let idx =
                                (oy * g.stride + wy) * g.input.width + ox * g.stride + wx;
                            if src[idx] > best {
                                best = src[idx];
                                best_idx = idx;
                            }
                        }
                    }
                    dst[best_idx] += deltas[oy * ow + ox];
                }
            }
            let z_plane = &z_prev[p * plane..(p + 1) * plane];
            for (d, &z) in dst.iter_mut().zip(z_plane) {
                *d *= f_prev.derivative(z);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorShape;

    #[test]
    fn test_dense_forward_known_values() {
        let backend = ReferenceBackend::new();
        let dims = DenseDims {
            entities: 1,
            inputs: 2,
            outputs: 2,
        };
        // x = [1, 2], W = [[1, 2], [3, 4]], b = [0.5, -0.5]
        let x = [1.0, 2.0];
        let w = [1.0, 2.0, 3.0, 4.0];
        let b = [0.5, -0.5];
        let mut z = [0.0f32; 2];
        let mut a = [0.0f32; 2];
        backend
            .dense_forward(dims, &x, &w, &b, &mut z, &mut a, ActivationKind::Identity)
            .unwrap();
        assert_eq!(z, [7.5, 9.5]);
        assert_eq!(a, z);
    }

    #[test]
    fn test_dense_backward_transposes_weights() {
        let backend = ReferenceBackend::new();
        let dims = DenseDims {
            entities: 1,
            inputs: 2,
            outputs: 2,
        };
        let w = [1.0, 2.0, 3.0, 4.0];
        let dy = [1.0, 1.0];
        let z_prev = [0.0, 0.0];
        let mut out = [0.0f32; 2];
        backend
            .dense_backward(dims, &z_prev, &dy, &w, ActivationKind::Identity, &mut out)
            .unwrap();
        // dy · Wᵀ = [1+2, 3+4]
        assert_eq!(out, [3.0, 7.0]);
    }

    #[test]
    fn test_dense_gradient_sums_over_batch() {
        let backend = ReferenceBackend::new();
        let dims = DenseDims {
            entities: 2,
            inputs: 2,
            outputs: 1,
        };
        let x = [1.0, 2.0, 3.0, 4.0];
        let dy = [1.0, 2.0];
        let mut dw = [0.0f32; 2];
        let mut db = [0.0f32; 1];
        backend.dense_gradient(dims, &x, &dy, &mut dw, &mut db).unwrap();
        // dw[i] = sum_e x[e][i] * dy[e]
        assert_eq!(dw, [1.0 + 6.0, 2.0 + 8.0]);
        assert_eq!(db, [3.0]);
    }

    #[test]
    fn test_conv_forward_identity_kernel() {
        let backend = ReferenceBackend::new();
        let g = ConvGeometry::new(TensorShape::new(1, 3, 3), 1, 1, 1, 1, 0, 1).unwrap();
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let w = [2.0];
        let b = [1.0];
        let mut z = [0.0f32; 9];
        let mut a = [0.0f32; 9];
        backend
            .conv_forward(&g, &x, &w, &b, &mut z, &mut a, ActivationKind::Identity)
            .unwrap();
        for (i, &value) in z.iter().enumerate() {
            assert_eq!(value, x[i] * 2.0 + 1.0);
        }
    }

    #[test]
    fn test_conv_forward_padding_reaches_borders() {
        let backend = ReferenceBackend::new();
        // 3x3 kernel of ones over a 2x2 input with padding 1 keeps the size.
        let g = ConvGeometry::new(TensorShape::new(1, 2, 2), 1, 3, 3, 1, 1, 1).unwrap();
        let x = [1.0, 1.0, 1.0, 1.0];
        let w = [1.0f32; 9];
        let b = [0.0];
        let mut z = [0.0f32; 4];
        let mut a = [0.0f32; 4];
        backend
            .conv_forward(&g, &x, &w, &b, &mut z, &mut a, ActivationKind::Identity)
            .unwrap();
        // Every output sees all four inputs (the rest of the window is padding).
        assert_eq!(z, [4.0, 4.0, 4.0, 4.0]);
    }

    #[test]
    fn test_pool_forward_and_backward_routing() {
        let backend = ReferenceBackend::new();
        let g = PoolGeometry::new(TensorShape::new(1, 2, 2), 2, 2, 1).unwrap();
        let x = [1.0, 5.0, 2.0, 3.0];
        let mut out = [0.0f32; 1];
        backend.pool_forward(&g, &x, &mut out).unwrap();
        assert_eq!(out, [5.0]);

        let dy = [2.0];
        let z_prev = [0.0f32; 4];
        let mut down = [0.0f32; 4];
        backend
            .pool_backward(&g, &x, &dy, &z_prev, ActivationKind::Identity, &mut down)
            .unwrap();
        assert_eq!(down, [0.0, 2.0, 0.0, 0.0]);
    }
}
