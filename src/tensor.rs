//! Dense tensor buffers and shape metadata
//!
//! This module provides the [`TensorShape`] descriptor, the [`Tensor`] buffer
//! that flows between layers, and a [`TensorPool`] that recycles buffers
//! across training batches.
//!
//! A tensor is a flat row-major `Vec<f32>` logically addressed as
//! `entities` rows of `shape.size()` elements each. The per-entity shape is
//! fixed when a layer is built; the entity count (batch size) is set per
//! forward call.

use crate::error::{shape_mismatch, Result};

/// Immutable per-entity shape descriptor: channels × height × width.
///
/// The entity count (batch size) is deliberately not part of the shape; it
/// belongs to each [`Tensor`] and changes from batch to batch.
///
/// # Example
///
/// ```
/// use tensornet::TensorShape;
///
/// let image = TensorShape::new(3, 28, 28);
/// assert_eq!(image.size(), 3 * 28 * 28);
///
/// let features = TensorShape::linear(256);
/// assert_eq!(features.size(), 256);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorShape {
    /// Number of channels (feature maps).
    pub channels: usize,
    /// Height of each channel.
    pub height: usize,
    /// Width of each channel.
    pub width: usize,
}

impl TensorShape {
    /// Creates a new shape descriptor.
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Creates a flat 1 × 1 × `size` shape, used by fully connected layers.
    pub fn linear(size: usize) -> Self {
        Self {
            channels: 1,
            height: 1,
            width: size,
        }
    }

    /// Total number of values per entity: channels × height × width.
    pub fn size(&self) -> usize {
        self.channels * self.height * self.width
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.channels, self.height, self.width)
    }
}

/// A dense buffer of 32-bit floats tagged with an entity count and a
/// per-entity shape.
///
/// Tensors are exclusively owned: each pass hands ownership from producer to
/// consumer, so two live owners never alias the same buffer. Allocation
/// always yields fully zero-initialized memory and duplication is a deep
/// copy.
///
/// # Example
///
/// ```
/// use tensornet::{Tensor, TensorShape};
///
/// let t = Tensor::zeroed(TensorShape::linear(4), 2);
/// assert_eq!(t.len(), 8);
/// assert!(t.data().iter().all(|&v| v == 0.0));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: TensorShape,
    entities: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Allocates a zero-initialized tensor for `entities` rows of `shape`.
    pub fn zeroed(shape: TensorShape, entities: usize) -> Self {
        Self {
            shape,
            entities,
            data: vec![0.0f32; shape.size() * entities],
        }
    }

    /// Wraps an existing buffer, checking that its length matches
    /// `entities × shape.size()`.
    pub fn from_vec(shape: TensorShape, entities: usize, data: Vec<f32>) -> Result<Self> {
        let expected = shape.size() * entities;
        if data.len() != expected {
            return Err(shape_mismatch(format!(
                "tensor buffer has {} values, expected {} ({} entities of {})",
                data.len(),
                expected,
                entities,
                shape
            )));
        }
        Ok(Self {
            shape,
            entities,
            data,
        })
    }

    /// The per-entity shape.
    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    /// Number of entities (batch size) in this tensor.
    pub fn entities(&self) -> usize {
        self.entities
    }

    /// Total number of values: entities × shape.size().
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor holds no values.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Immutable view of the whole buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the whole buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Immutable view of one entity's values.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn entity(&self, index: usize) -> &[f32] {
        let size = self.shape.size();
        &self.data[index * size..(index + 1) * size]
    }

    /// Deep copy of this tensor.
    pub fn duplicate(&self) -> Tensor {
        self.clone()
    }

    /// Copies this tensor's values into an existing tensor of identical
    /// shape and entity count.
    pub fn copy_into(&self, dst: &mut Tensor) -> Result<()> {
        if dst.shape != self.shape || dst.entities != self.entities {
            return Err(shape_mismatch(format!(
                "cannot copy {} entities of {} into {} entities of {}",
                self.entities, self.shape, dst.entities, dst.shape
            )));
        }
        dst.data.copy_from_slice(&self.data);
        Ok(())
    }

    /// Consumes the tensor and returns its backing buffer.
    pub(crate) fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// A free list of tensor buffers, recycled across batches.
///
/// The trainer allocates its per-batch scratch tensors from a pool and
/// releases them once the batch has been consumed, so steady-state training
/// performs no buffer allocation after the first epoch. Buffers handed out
/// by [`allocate`](TensorPool::allocate) are always zeroed, regardless of
/// what the previous owner left in them.
pub struct TensorPool {
    free: Vec<Vec<f32>>,
}

impl TensorPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    /// Allocates a zeroed tensor, reusing a released buffer when one with
    /// sufficient capacity is available.
    pub fn allocate(&mut self, shape: TensorShape, entities: usize) -> Tensor {
        let needed = shape.size() * entities;
        let position = self.free.iter().position(|buf| buf.capacity() >= needed);
        match position {
            Some(i) => {
                let mut buf = self.free.swap_remove(i);
                buf.clear();
                buf.resize(needed, 0.0);
                Tensor {
                    shape,
                    entities,
                    data: buf,
                }
            }
            None => Tensor::zeroed(shape, entities),
        }
    }

    /// Returns a tensor's buffer to the pool for reuse.
    pub fn release(&mut self, tensor: Tensor) {
        self.free.push(tensor.into_vec());
    }

    /// Number of buffers currently held by the pool.
    pub fn retained(&self) -> usize {
        self.free.len()
    }
}

impl Default for TensorPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_size() {
        assert_eq!(TensorShape::new(3, 28, 28).size(), 2352);
        assert_eq!(TensorShape::linear(784).size(), 784);
        assert_eq!(TensorShape::new(1, 1, 1).size(), 1);
    }

    #[test]
    fn test_zeroed_is_fully_initialized() {
        let t = Tensor::zeroed(TensorShape::new(2, 3, 3), 4);
        assert_eq!(t.len(), 2 * 3 * 3 * 4);
        assert_eq!(t.entities(), 4);
        assert!(t.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_from_vec_length_check() {
        let shape = TensorShape::linear(3);
        assert!(Tensor::from_vec(shape, 2, vec![1.0; 6]).is_ok());
        assert!(Tensor::from_vec(shape, 2, vec![1.0; 5]).is_err());
    }

    #[test]
    fn test_entity_view() {
        let t = Tensor::from_vec(TensorShape::linear(2), 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        assert_eq!(t.entity(0), &[1.0, 2.0]);
        assert_eq!(t.entity(2), &[5.0, 6.0]);
    }

    #[test]
    fn test_duplicate_is_deep() {
        let original =
            Tensor::from_vec(TensorShape::linear(2), 1, vec![1.0, 2.0]).unwrap();
        let mut copy = original.duplicate();
        copy.data_mut()[0] = 99.0;
        assert_eq!(original.data()[0], 1.0);
    }

    #[test]
    fn test_copy_into_requires_matching_layout() {
        let src = Tensor::from_vec(TensorShape::linear(2), 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut dst = Tensor::zeroed(TensorShape::linear(2), 2);
        src.copy_into(&mut dst).unwrap();
        assert_eq!(dst.data(), src.data());

        let mut wrong = Tensor::zeroed(TensorShape::linear(4), 1);
        assert!(src.copy_into(&mut wrong).is_err());
    }

    #[test]
    fn test_pool_reuses_buffers() {
        let mut pool = TensorPool::new();
        let shape = TensorShape::linear(16);

        let mut t = pool.allocate(shape, 4);
        t.data_mut().fill(7.0);
        let capacity_marker = t.data().as_ptr();
        pool.release(t);
        assert_eq!(pool.retained(), 1);

        // Same layout comes back from the free list, zeroed.
        let t = pool.allocate(shape, 4);
        assert_eq!(t.data().as_ptr(), capacity_marker);
        assert!(t.data().iter().all(|&v| v == 0.0));
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_pool_smaller_allocation_reuses_capacity() {
        let mut pool = TensorPool::new();
        pool.release(Tensor::zeroed(TensorShape::linear(64), 2));

        let t = pool.allocate(TensorShape::linear(8), 2);
        assert_eq!(t.len(), 16);
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_pool_allocates_fresh_when_capacity_insufficient() {
        let mut pool = TensorPool::new();
        pool.release(Tensor::zeroed(TensorShape::linear(4), 1));

        let t = pool.allocate(TensorShape::linear(1024), 8);
        assert_eq!(t.len(), 8192);
        // The small buffer stays in the pool for a later fit.
        assert_eq!(pool.retained(), 1);
    }
}
