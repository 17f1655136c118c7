//! Accelerated data-parallel backend
//!
//! Dispatches the embarrassingly parallel per-element computations as a grid
//! of independent tasks (one task per output row or plane, each writing a
//! disjoint output region) and routes the dense matrix products through
//! blocked SGEMM kernels. Because the blocked kernels reorder floating point
//! sums, results match the reference backend numerically rather than
//! bit-exactly.
//!
//! Convolution kernels stage their input into a padded workspace acquired
//! from a [`DeviceContext`]: a bounded arena of device-resident buffers.
//! Buffers are scoped RAII guards, so every exit path of a kernel call,
//! success or error, returns them to the arena and no allocation outlives
//! a single forward/backward invocation.

use std::sync::Mutex;

use rayon::prelude::*;

use crate::activations::ActivationKind;
use crate::backend::{Backend, ConvGeometry, DenseDims, PoolGeometry};
use crate::error::{NetError, Result};

/// Default arena budget: 64M floats (256 MiB).
const DEFAULT_BUDGET: usize = 64 * 1024 * 1024;

struct ArenaState {
    free: Vec<Vec<f32>>,
    in_use: usize,
}

/// A bounded arena of device-resident scratch buffers.
///
/// The context is constructed explicitly and handed to the backend that owns
/// it, never reached through process-wide state, so a test can build an
/// accelerated backend with a deliberately tiny budget and observe
/// [`NetError::ResourceExhaustion`] deterministically.
///
/// Multiple layers may share one context (they share the backend), but each
/// buffer is owned by exactly one kernel call for its whole lifetime.
pub struct DeviceContext {
    budget: usize,
    state: Mutex<ArenaState>,
}

impl DeviceContext {
    /// Creates a context that will hand out at most `budget_floats` floats
    /// at any one time.
    pub fn new(budget_floats: usize) -> Self {
        Self {
            budget: budget_floats,
            state: Mutex::new(ArenaState {
                free: Vec::new(),
                in_use: 0,
            }),
        }
    }

    /// The configured budget in floats.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Floats currently held by live buffers. Zero whenever no kernel call
    /// is in flight.
    pub fn floats_in_use(&self) -> usize {
        self.state.lock().unwrap().in_use
    }

    /// Acquires a zeroed scoped buffer of `len` floats.
    pub fn allocate(&self, len: usize) -> Result<DeviceBuffer<'_>> {
        let mut state = self.state.lock().unwrap();
        if state.in_use + len > self.budget {
            return Err(NetError::ResourceExhaustion {
                requested: len,
                in_use: state.in_use,
                budget: self.budget,
            });
        }
        state.in_use += len;
        let mut data = match state
            .free
            .iter()
            .position(|buf| buf.capacity() >= len)
        {
            Some(i) => state.free.swap_remove(i),
            None => Vec::with_capacity(len),
        };
        data.clear();
        data.resize(len, 0.0);
        Ok(DeviceBuffer {
            context: self,
            data: Some(data),
        })
    }

    fn reclaim(&self, data: Vec<f32>) {
        let mut state = self.state.lock().unwrap();
        state.in_use -= data.len();
        state.free.push(data);
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET)
    }
}

/// A scoped device buffer; returns itself to the owning context on drop.
pub struct DeviceBuffer<'a> {
    context: &'a DeviceContext,
    data: Option<Vec<f32>>,
}

impl std::fmt::Debug for DeviceBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("len", &self.data.as_ref().map(|d| d.len()))
            .finish()
    }
}

impl std::ops::Deref for DeviceBuffer<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        self.data.as_ref().unwrap()
    }
}

impl std::ops::DerefMut for DeviceBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [f32] {
        self.data.as_mut().unwrap()
    }
}

impl Drop for DeviceBuffer<'_> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.context.reclaim(data);
        }
    }
}

/// Blocked row-major SGEMM: `c = a · b` with explicit strides.
fn sgemm(
    m: usize,
    k: usize,
    n: usize,
    a: &[f32],
    rsa: isize,
    csa: isize,
    b: &[f32],
    rsb: isize,
    csb: isize,
    c: &mut [f32],
) {
    debug_assert!(c.len() >= m * n, "sgemm output buffer too small");
    unsafe {
        matrixmultiply::sgemm(
            m,
            k,
            n,
            1.0,
            a.as_ptr(),
            rsa,
            csa,
            b.as_ptr(),
            rsb,
            csb,
            0.0,
            c.as_mut_ptr(),
            n as isize,
            1,
        );
    }
}

/// The data-parallel backend.
pub struct AcceleratedBackend {
    context: DeviceContext,
}

impl AcceleratedBackend {
    /// Creates a backend with the default arena budget.
    pub fn new() -> Self {
        Self {
            context: DeviceContext::default(),
        }
    }

    /// Creates a backend over an explicitly configured context.
    pub fn with_context(context: DeviceContext) -> Self {
        Self { context }
    }

    /// The backend's device context.
    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    /// Stages `x` into a zero-padded workspace, one padded image per entity.
    fn stage_padded<'a>(&'a self, g: &ConvGeometry, x: &[f32]) -> Result<DeviceBuffer<'a>> {
        let (ph, pw) = (g.padded_height(), g.padded_width());
        let channels = g.input.channels;
        let mut ws = self.context.allocate(g.workspace_len())?;
        ws.par_chunks_mut(channels * ph * pw)
            .zip(x.par_chunks(g.input.size()))
            .for_each(|(padded, entity)| {
                for ic in 0..channels {
                    for iy in 0..g.input.height {
                        let src = &entity
                            [(ic * g.input.height + iy) * g.input.width..][..g.input.width];
                        let offset = (ic * ph + iy + g.padding) * pw + g.padding;
                        padded[offset..offset + g.input.width].copy_from_slice(src);
                    }
                }
            });
        Ok(ws)
    }
}

impl Default for AcceleratedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for AcceleratedBackend {
    fn name(&self) -> &'static str {
        "accelerated"
    }

    fn activation_forward(&self, z: &[f32], a: &mut [f32], f: ActivationKind) -> Result<()> {
        debug_assert_eq!(z.len(), a.len(), "activation buffer length mismatch");
        a.par_iter_mut()
            .zip(z.par_iter())
            .for_each(|(a, &z)| *a = f.apply(z));
        Ok(())
    }

    fn activation_backward(&self, z: &[f32], delta: &mut [f32], f: ActivationKind) -> Result<()> {
        debug_assert_eq!(z.len(), delta.len(), "activation buffer length mismatch");
        delta
            .par_iter_mut()
            .zip(z.par_iter())
            .for_each(|(d, &z)| *d *= f.derivative(z));
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

        sgemm(n, l, k, x, l as isize, 1, w, k as isize, 1, z);
        z.par_chunks_mut(k)
            .zip(a.par_chunks_mut(k))
            .for_each(|(z_row, a_row)| {
                for j in 0..k {
                    z_row[j] += b[j];
                    a_row[j] = f.apply(z_row[j]);
                }
            });
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

        // out = dy · Wᵀ, reading W through transposed strides.
        sgemm(n, k, l, dy, k as isize, 1, w, 1, k as isize, out);
        out.par_iter_mut()
            .zip(z_prev.par_iter())
            .for_each(|(d, &z)| *d *= f_prev.derivative(z));
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

        // dw = xᵀ · dy, reading x through transposed strides.
        sgemm(l, n, k, x, 1, l as isize, dy, k as isize, 1, dw);
        db.par_iter_mut().enumerate().for_each(|(j, db)| {
            let mut sum = 0.0f32;
            for e in 0..n {
                sum += dy[e * k + j];
            }
            *db = sum;
        });
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
        let ws = self.stage_padded(g, x)?;
        let padded = &ws[..];
        let (ph, pw) = (g.padded_height(), g.padded_width());
        let channels = g.input.channels;
        let (oh, ow) = (g.output.height, g.output.width);
        let out_size = g.output.size();
        debug_assert_eq!(w.len(), g.weight_count());
        debug_assert_eq!(z.len(), g.entities * out_size);

        z.par_chunks_mut(out_size)
            .zip(a.par_chunks_mut(out_size))
            .enumerate()
            .for_each(|(e, (z_row, a_row))| {
                let image = &padded[e * channels * ph * pw..][..channels * ph * pw];
                for oc in 0..g.kernels {
                    let bank = &w[oc * channels * g.kernel_height * g.kernel_width..]
                        [..channels * g.kernel_height * g.kernel_width];
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let mut sum = b[oc];
                            for ic in 0..channels {
                                for ky in 0..g.kernel_height {
                                    let row_offset =
                                        (ic * ph + oy * g.stride + ky) * pw + ox * g.stride;
                                    let k_offset =
                                        (ic * g.kernel_height + ky) * g.kernel_width;
                                    for kx in 0..g.kernel_width {
                                        sum += image[row_offset + kx] * bank[k_offset + kx];
                                    }
                                }
                            }
                            let idx = (oc * oh + oy) * ow + ox;
                            z_row[idx] = sum;
                            a_row[idx] = f.apply(sum);
                        }
                    }
                }
            });
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
        debug_assert_eq!(out.len(), g.entities * in_size);

        out.par_chunks_mut(in_size)
            .zip(z_prev.par_chunks(in_size))
            .enumerate()
            .for_each(|(e, (o_row, z_row))| {
                let deltas = &dy[e * out_size..][..out_size];
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
                                        sum += deltas[(oc * oh + oy) * ow + ox]
                                            * w[((oc * channels + ic) * g.kernel_height + ky)
                                                * g.kernel_width
                                                + kx];
                                    }
                                }
                            }
                            let idx = (ic * g.input.height + iy) * g.input.width + ix;
                            o_row[idx] = f_prev.derivative(z_row[idx]) * sum;
                        }
                    }
                }
            });
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
        let ws = self.stage_padded(g, x)?;
        let padded = &ws[..];
        let (ph, pw) = (g.padded_height(), g.padded_width());
        let channels = g.input.channels;
        let (oh, ow) = (g.output.height, g.output.width);
        let out_size = g.output.size();
        debug_assert_eq!(dw.len(), g.weight_count());
        debug_assert_eq!(db.len(), g.kernels);

        dw.par_chunks_mut(channels * g.kernel_height * g.kernel_width)
            .enumerate()
            .for_each(|(oc, bank)| {
                for ic in 0..channels {
                    for ky in 0..g.kernel_height {
                        for kx in 0..g.kernel_width {
                            let mut sum = 0.0f32;
                            for e in 0..g.entities {
                                let image = &padded[e * channels * ph * pw..];
                                let deltas = &dy[e * out_size..];
                                for oy in 0..oh {
                                    let row_offset = (ic * ph + oy * g.stride + ky) * pw + kx;
                                    let d_offset = (oc * oh + oy) * ow;
                                    for ox in 0..ow {
                                        sum += image[row_offset + ox * g.stride]
                                            * deltas[d_offset + ox];
                                    }
                                }
                            }
                            bank[(ic * g.kernel_height + ky) * g.kernel_width + kx] = sum;
                        }
                    }
                }
            });

        db.par_iter_mut().enumerate().for_each(|(oc, db)| {
            let mut sum = 0.0f32;
            for e in 0..g.entities {
                let offset = e * out_size + oc * oh * ow;
                for &d in &dy[offset..offset + oh * ow] {
                    sum += d;
                }
            }
            *db = sum;
        });
        Ok(())
    }

    fn pool_forward(&self, g: &PoolGeometry, x: &[f32], out: &mut [f32]) -> Result<()> {
        let (oh, ow) = (g.output.height, g.output.width);
        let plane = g.input.height * g.input.width;
        let out_plane = oh * ow;
        debug_assert_eq!(out.len(), g.entities * g.input.channels * out_plane);

        out.par_chunks_mut(out_plane)
            .zip(x.par_chunks(plane))
            .for_each(|(dst, src)| {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best = f32::NEG_INFINITY;
                        for wy in 0..g.window {
                            for wx in 0..g.window {
                                let value = src
                                    [(oy * g.stride + wy) * g.input.width + ox * g.stride + wx];
                                if value > best {
                                    best = value;
                                }
                            }
                        }
                        dst[oy * ow + ox] = best;
                    }
                }
            });
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
        debug_assert_eq!(out.len(), g.entities * g.input.channels * plane);

        // One task per input plane: overlapping windows within a plane are
        // accumulated sequentially, planes never alias each other.
        out.par_chunks_mut(plane)
            .zip(x.par_chunks(plane))
            .zip(z_prev.par_chunks(plane))
            .zip(dy.par_chunks(out_plane))
            .for_each(|(((dst, src), z_plane), deltas)| {
                dst.fill(0.0);
                for oy in 0..oh {
                    for ox in 0..ow {
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
                for (d, &z) in dst.iter_mut().zip(z_plane.iter()) {
                    *d *= f_prev.derivative(z);
                }
            });
        Ok(())
    }
}
