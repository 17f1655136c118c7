//! Dataset collaborators for training, validation and testing
//!
//! The core consumes batches through the [`BatchSource`] interface: a
//! restartable, finite sequence of (input, expected output) tensor pairs
//! covering the dataset once per epoch. [`BatchSet`] is the in-memory
//! implementation; [`ValidationSet`] pairs a batch set with the convergence
//! parameters the trainer evaluates against it.

use crate::error::{invalid_argument, shape_mismatch, Result};
use crate::tensor::{Tensor, TensorShape};

/// A batched dataset the trainer iterates once per epoch.
pub trait BatchSource {
    /// Per-entity shape of the input tensors.
    fn input_shape(&self) -> TensorShape;

    /// Per-entity shape of the expected output tensors.
    fn target_shape(&self) -> TensorShape;

    /// Total number of samples.
    fn sample_count(&self) -> usize;

    /// Configured number of samples per batch; the final batch of an epoch
    /// may be smaller.
    fn batch_size(&self) -> usize;

    /// Number of batches per epoch.
    fn batch_count(&self) -> usize;

    /// A fresh iteration over the whole dataset in a fixed order. Each call
    /// restarts from the first batch.
    fn batches(&self) -> Box<dyn Iterator<Item = (Tensor, Tensor)> + '_>;
}

/// An in-memory dataset holding all samples in two flat buffers.
///
/// # Example
///
/// ```
/// use tensornet::{BatchSet, BatchSource, TensorShape};
///
/// let set = BatchSet::new(
///     TensorShape::linear(2),
///     TensorShape::linear(1),
///     vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0],
///     vec![0.0, 1.0, 1.0, 0.0],
///     2,
/// )
/// .unwrap();
/// assert_eq!(set.sample_count(), 4);
/// assert_eq!(set.batch_count(), 2);
/// ```
pub struct BatchSet {
    input_shape: TensorShape,
    target_shape: TensorShape,
    inputs: Vec<f32>,
    targets: Vec<f32>,
    samples: usize,
    batch_size: usize,
}

impl BatchSet {
    /// Wraps flat sample buffers: `inputs` holds `samples` rows of
    /// `input_shape.size()` values, `targets` the matching expected
    /// outputs.
    pub fn new(
        input_shape: TensorShape,
        target_shape: TensorShape,
        inputs: Vec<f32>,
        targets: Vec<f32>,
        batch_size: usize,
    ) -> Result<Self> {
        if input_shape.size() == 0 || inputs.len() % input_shape.size() != 0 {
            return Err(shape_mismatch(format!(
                "input buffer of {} values is not a whole number of {} samples",
                inputs.len(),
                input_shape
            )));
        }
        let samples = inputs.len() / input_shape.size();
        if samples == 0 {
            return Err(invalid_argument("dataset needs at least one sample"));
        }
        if targets.len() != samples * target_shape.size() {
            return Err(shape_mismatch(format!(
                "expected {} target values for {} samples of {}, got {}",
                samples * target_shape.size(),
                samples,
                target_shape,
                targets.len()
            )));
        }
        if batch_size == 0 {
            return Err(invalid_argument("batch size must be at least 1"));
        }
        Ok(Self {
            input_shape,
            target_shape,
            inputs,
            targets,
            samples,
            batch_size,
        })
    }

    /// Builds a dataset from per-sample (input, target) pairs.
    pub fn from_samples(
        input_shape: TensorShape,
        target_shape: TensorShape,
        samples: &[(Vec<f32>, Vec<f32>)],
        batch_size: usize,
    ) -> Result<Self> {
        let mut inputs = Vec::with_capacity(samples.len() * input_shape.size());
        let mut targets = Vec::with_capacity(samples.len() * target_shape.size());
        for (input, target) in samples {
            if input.len() != input_shape.size() || target.len() != target_shape.size() {
                return Err(shape_mismatch(format!(
                    "sample of {} inputs / {} targets does not match {} / {}",
                    input.len(),
                    target.len(),
                    input_shape,
                    target_shape
                )));
            }
            inputs.extend_from_slice(input);
            targets.extend_from_slice(target);
        }
        Self::new(input_shape, target_shape, inputs, targets, batch_size)
    }

    /// Reconfigures the batch size.
    pub fn set_batch_size(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(invalid_argument("batch size must be at least 1"));
        }
        self.batch_size = batch_size;
        Ok(())
    }

    /// Number of entities in a given batch; the final batch carries the
    /// remainder.
    pub fn batch_entities(&self, index: usize) -> usize {
        let start = index * self.batch_size;
        self.batch_size.min(self.samples - start.min(self.samples))
    }

    /// Copies one batch into pre-allocated tensors, which must already have
    /// the batch's entity count and this dataset's shapes. Used by the
    /// trainer to reuse pooled buffers across batches.
    pub fn copy_batch_into(
        &self,
        index: usize,
        input: &mut Tensor,
        target: &mut Tensor,
    ) -> Result<()> {
        let entities = self.batch_entities(index);
        if entities == 0 {
            return Err(invalid_argument(format!("batch index {} is out of range", index)));
        }
        if input.shape() != self.input_shape
            || target.shape() != self.target_shape
            || input.entities() != entities
            || target.entities() != entities
        {
            return Err(shape_mismatch(format!(
                "batch {} holds {} entities of {} / {}",
                index, entities, self.input_shape, self.target_shape
            )));
        }
        let start = index * self.batch_size;
        let in_size = self.input_shape.size();
        let t_size = self.target_shape.size();
        input
            .data_mut()
            .copy_from_slice(&self.inputs[start * in_size..(start + entities) * in_size]);
        target
            .data_mut()
            .copy_from_slice(&self.targets[start * t_size..(start + entities) * t_size]);
        Ok(())
    }
}

impl BatchSource for BatchSet {
    fn input_shape(&self) -> TensorShape {
        self.input_shape
    }

    fn target_shape(&self) -> TensorShape {
        self.target_shape
    }

    fn sample_count(&self) -> usize {
        self.samples
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn batch_count(&self) -> usize {
        (self.samples + self.batch_size - 1) / self.batch_size
    }

    fn batches(&self) -> Box<dyn Iterator<Item = (Tensor, Tensor)> + '_> {
        let in_size = self.input_shape.size();
        let t_size = self.target_shape.size();
        Box::new((0..self.batch_count()).map(move |index| {
            let start = index * self.batch_size;
            let entities = self.batch_entities(index);
            let input = Tensor::from_vec(
                self.input_shape,
                entities,
                self.inputs[start * in_size..(start + entities) * in_size].to_vec(),
            )
            .expect("batch bounds are derived from the dataset");
            let target = Tensor::from_vec(
                self.target_shape,
                entities,
                self.targets[start * t_size..(start + entities) * t_size].to_vec(),
            )
            .expect("batch bounds are derived from the dataset");
            (input, target)
        }))
    }
}

/// A validation dataset together with its convergence criterion.
///
/// Convergence holds when the relative change of validation cost between
/// every pair of consecutive epochs in the most recent `window` epochs is
/// at most `tolerance`.
pub struct ValidationSet {
    batches: BatchSet,
    tolerance: f32,
    window: usize,
}

impl ValidationSet {
    /// Wraps a dataset with a convergence tolerance and epoch window.
    ///
    /// The window must cover at least two epochs so there is a consecutive
    /// pair to compare.
    pub fn new(batches: BatchSet, tolerance: f32, window: usize) -> Result<Self> {
        if !(tolerance > 0.0) {
            return Err(invalid_argument("convergence tolerance must be positive"));
        }
        if window < 2 {
            return Err(invalid_argument("convergence window must span at least 2 epochs"));
        }
        Ok(Self {
            batches,
            tolerance,
            window,
        })
    }

    /// The underlying dataset.
    pub fn batches(&self) -> &BatchSet {
        &self.batches
    }

    /// Maximum relative cost change that still counts as stable.
    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// Number of trailing epochs that must all be stable.
    pub fn window(&self) -> usize {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_set(batch_size: usize) -> BatchSet {
        BatchSet::new(
            TensorShape::linear(2),
            TensorShape::linear(1),
            vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0],
            vec![0.0, 1.0, 1.0, 0.0],
            batch_size,
        )
        .unwrap()
    }

    #[test]
    fn test_batch_count_rounds_up() {
        assert_eq!(xor_set(2).batch_count(), 2);
        assert_eq!(xor_set(3).batch_count(), 2);
        assert_eq!(xor_set(4).batch_count(), 1);
        assert_eq!(xor_set(5).batch_count(), 1);
    }

    #[test]
    fn test_batches_cover_dataset_once() {
        let set = xor_set(3);
        let batches: Vec<_> = set.batches().collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0.entities(), 3);
        assert_eq!(batches[1].0.entities(), 1);
        assert_eq!(batches[1].0.data(), &[1.0, 1.0]);
        assert_eq!(batches[1].1.data(), &[0.0]);
    }

    #[test]
    fn test_batches_restart_from_the_beginning() {
        let set = xor_set(2);
        let first: Vec<_> = set.batches().collect();
        let second: Vec<_> = set.batches().collect();
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].0.data(), second[0].0.data());
    }

    #[test]
    fn test_copy_batch_into_reused_tensor() {
        let set = xor_set(2);
        let mut input = Tensor::zeroed(TensorShape::linear(2), 2);
        let mut target = Tensor::zeroed(TensorShape::linear(1), 2);
        set.copy_batch_into(1, &mut input, &mut target).unwrap();
        assert_eq!(input.data(), &[1.0, 0.0, 1.0, 1.0]);
        assert_eq!(target.data(), &[1.0, 0.0]);
    }

    #[test]
    fn test_copy_batch_into_checks_entity_count() {
        let set = xor_set(3);
        // Final batch has a single entity, not three.
        let mut input = Tensor::zeroed(TensorShape::linear(2), 3);
        let mut target = Tensor::zeroed(TensorShape::linear(1), 3);
        assert!(set.copy_batch_into(1, &mut input, &mut target).is_err());
    }

    #[test]
    fn test_mismatched_buffers_rejected() {
        assert!(BatchSet::new(
            TensorShape::linear(2),
            TensorShape::linear(1),
            vec![0.0; 7],
            vec![0.0; 4],
            2
        )
        .is_err());
        assert!(BatchSet::new(
            TensorShape::linear(2),
            TensorShape::linear(1),
            vec![0.0; 8],
            vec![0.0; 3],
            2
        )
        .is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(xor_set(2).set_batch_size(0).is_err());
        let mut set = xor_set(2);
        set.set_batch_size(4).unwrap();
        assert_eq!(set.batch_count(), 1);
    }

    #[test]
    fn test_validation_set_parameters() {
        assert!(ValidationSet::new(xor_set(2), 0.01, 2).is_ok());
        assert!(ValidationSet::new(xor_set(2), 0.0, 2).is_err());
        assert!(ValidationSet::new(xor_set(2), 0.01, 1).is_err());
    }
}
