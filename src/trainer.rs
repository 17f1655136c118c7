//! Training orchestration loop
//!
//! Drives mini-batch gradient descent over epochs: for each batch, forward
//! in training mode, cost, backward, gradients, optimizer update, then the
//! batch progress callback; after each epoch, optional validation and test
//! scoring, the epoch callback, and the convergence test. Batches within an
//! epoch are strictly sequential: the optimizer step for batch N completes
//! before batch N+1's forward begins, because weights are shared mutable
//! state between the forward pass and the update.
//!
//! The loop itself is single-threaded and synchronous;
//! [`train_background`] runs the identical loop on a spawned thread.
//! Cancellation is cooperative and observed at batch and epoch boundaries
//! only, so it is bounded by one batch's compute time. Per-layer
//! computation may still be internally data-parallel, depending on the
//! backend the layers were built with.

use std::thread::{self, JoinHandle};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::dataset::{BatchSet, BatchSource, ValidationSet};
use crate::error::{invalid_argument, shape_mismatch, Result};
use crate::network::SequentialNetwork;
use crate::optimizers::OptimizerConfig;
use crate::progress::{
    BatchProgress, CancellationToken, EpochReport, StopReason, TrainingSessionResult,
};
use crate::tensor::TensorPool;

/// Trains a network over a dataset.
///
/// # Arguments
///
/// * `network` - The network to train; mutated in place
/// * `dataset` - Training batches, iterated once per epoch in order
/// * `optimizer` - Update rule, base learning rate and schedule
/// * `epochs` - Number of epochs to run (at least 1)
/// * `dropout` - Dropout probability for fully connected activations,
///   in `[0, 1)`; 0 disables dropout entirely
/// * `batch_progress` - Optional callback invoked after every batch
/// * `epoch_progress` - Optional callback invoked after every epoch
/// * `validation` - Optional validation dataset with its convergence
///   criterion, evaluated after each epoch
/// * `test` - Optional test dataset scored after each epoch for reporting
/// * `token` - Cooperative cancellation flag
///
/// # Errors
///
/// * InvalidArgument for `epochs < 1`, `dropout` outside `[0, 1)`, or bad
///   optimizer hyperparameters, checked before any work begins.
/// * ShapeMismatch when any dataset's sample shapes do not fit the
///   network.
/// * Errors raised mid-training abort the call; updates already applied to
///   the weights are retained, there is no rollback and no batch retry.
///
/// Cancellation and convergence are not errors: they return `Ok` with the
/// corresponding [`StopReason`] and the history gathered so far.
#[allow(clippy::too_many_arguments)]
pub fn train(
    network: &mut SequentialNetwork,
    dataset: &BatchSet,
    optimizer: &OptimizerConfig,
    epochs: usize,
    dropout: f32,
    mut batch_progress: Option<&mut dyn FnMut(BatchProgress)>,
    mut epoch_progress: Option<&mut dyn FnMut(&EpochReport)>,
    validation: Option<&ValidationSet>,
    test: Option<&BatchSet>,
    token: &CancellationToken,
) -> Result<TrainingSessionResult> {
    if epochs < 1 {
        return Err(invalid_argument("the number of epochs must be at least 1"));
    }
    if !(0.0..1.0).contains(&dropout) {
        return Err(invalid_argument(format!(
            "dropout probability {} is outside [0, 1)",
            dropout
        )));
    }
    optimizer.validate()?;
    check_dataset_fit(network, dataset, "training")?;
    if let Some(validation) = validation {
        check_dataset_fit(network, validation.batches(), "validation")?;
    }
    if let Some(test) = test {
        check_dataset_fit(network, test, "test")?;
    }

    let mut opt = optimizer.build();
    let mut rng = StdRng::from_entropy();
    let mut pool = TensorPool::new();
    let batch_count = dataset.batch_count();
    let mut reports: Vec<EpochReport> = Vec::new();
    let mut validation_costs: Vec<f32> = Vec::new();
    let mut batches_run = 0usize;
    let mut stop_reason = StopReason::Completed;

    info!(
        "training {} parameters for {} epochs of {} batches",
        network.parameter_count(),
        epochs,
        batch_count
    );

    'training: for epoch in 0..epochs {
        if token.is_cancelled() {
            stop_reason = StopReason::Cancelled;
            break 'training;
        }
        let learning_rate = optimizer.learning_rate_for(epoch);
        let mut cost_sum = 0.0f32;

        for batch in 0..batch_count {
            if token.is_cancelled() {
                stop_reason = StopReason::Cancelled;
                break 'training;
            }
            let entities = dataset.batch_entities(batch);
            let mut input = pool.allocate(dataset.input_shape(), entities);
            let mut target = pool.allocate(dataset.target_shape(), entities);
            dataset.copy_batch_into(batch, &mut input, &mut target)?;

            let trace = network.forward_train(&input, dropout, &mut rng)?;
            let batch_cost = network.cost().value(trace.output(), &target);
            let mut gradients = network.backward(&trace, &input, &target)?;

            // Gradients arrive summed over the batch; the optimizer takes
            // the mean.
            let scale = 1.0 / entities as f32;
            for gradient in &mut gradients {
                gradient.scale(scale);
            }
            for (index, gradient) in gradients.iter().enumerate() {
                let (weights, biases) = network.layer_parameters_mut(index);
                if !gradient.weights.is_empty() {
                    opt.update(2 * index, weights, &gradient.weights, learning_rate, epoch);
                }
                if !gradient.biases.is_empty() {
                    opt.update(
                        2 * index + 1,
                        biases,
                        &gradient.biases,
                        learning_rate,
                        epoch,
                    );
                }
            }

            batches_run += 1;
            cost_sum += batch_cost;
            if let Some(callback) = batch_progress.as_mut() {
                callback(BatchProgress {
                    epoch,
                    batch,
                    batch_count,
                    cost: batch_cost,
                });
            }

            trace.recycle(&mut pool);
            pool.release(input);
            pool.release(target);
        }

        let mut report = EpochReport {
            epoch,
            training_cost: cost_sum / batch_count as f32,
            validation: None,
            test: None,
        };
        if let Some(validation) = validation {
            let score = network.evaluate(validation.batches())?;
            validation_costs.push(score.cost);
            report.validation = Some(score);
        }
        if let Some(test) = test {
            report.test = Some(network.evaluate(test)?);
        }
        debug!(
            "epoch {}: training cost {:.6}, validation {:?}",
            epoch, report.training_cost, report.validation
        );
        if let Some(callback) = epoch_progress.as_mut() {
            callback(&report);
        }
        reports.push(report);

        if let Some(validation) = validation {
            if converged(&validation_costs, validation.tolerance(), validation.window()) {
                stop_reason = StopReason::Converged;
                break 'training;
            }
        }
    }

    info!(
        "training stopped: {:?} after {} epochs, {} batches",
        stop_reason,
        reports.len(),
        batches_run
    );
    Ok(TrainingSessionResult {
        stop_reason,
        epochs: reports,
        batches_run,
    })
}

/// Runs [`train`] on a background thread, returning the network together
/// with the session result when the thread is joined. Progress callbacks
/// are invoked on the training thread.
#[allow(clippy::too_many_arguments)]
pub fn train_background(
    mut network: SequentialNetwork,
    dataset: BatchSet,
    optimizer: OptimizerConfig,
    epochs: usize,
    dropout: f32,
    mut batch_progress: Option<Box<dyn FnMut(BatchProgress) + Send>>,
    mut epoch_progress: Option<Box<dyn FnMut(&EpochReport) + Send>>,
    validation: Option<ValidationSet>,
    test: Option<BatchSet>,
    token: CancellationToken,
) -> JoinHandle<(SequentialNetwork, Result<TrainingSessionResult>)> {
    thread::spawn(move || {
        let result = train(
            &mut network,
            &dataset,
            &optimizer,
            epochs,
            dropout,
            batch_progress
                .as_mut()
                .map(|f| f.as_mut() as &mut dyn FnMut(BatchProgress)),
            epoch_progress
                .as_mut()
                .map(|f| f.as_mut() as &mut dyn FnMut(&EpochReport)),
            validation.as_ref(),
            test.as_ref(),
            &token,
        );
        (network, result)
    })
}

fn check_dataset_fit(
    network: &SequentialNetwork,
    dataset: &BatchSet,
    role: &str,
) -> Result<()> {
    if dataset.input_shape().size() != network.input_shape().size() {
        return Err(shape_mismatch(format!(
            "{} samples of {} do not fit the network input {}",
            role,
            dataset.input_shape(),
            network.input_shape()
        )));
    }
    if dataset.target_shape().size() != network.output_shape().size() {
        return Err(shape_mismatch(format!(
            "{} targets of {} do not fit the network output {}",
            role,
            dataset.target_shape(),
            network.output_shape()
        )));
    }
    Ok(())
}

/// Convergence holds when the relative cost change between every pair of
/// consecutive epochs in the most recent `window` epochs is at most
/// `tolerance`. Fewer than `window` recorded costs is insufficient history
/// and never converges.
fn converged(costs: &[f32], tolerance: f32, window: usize) -> bool {
    if costs.len() < window {
        return false;
    }
    costs[costs.len() - window..].windows(2).all(|pair| {
        let change = (pair[1] - pair[0]).abs();
        change / pair[0].abs().max(f32::EPSILON) <= tolerance
    })
}
