//! Progress reporting and session results
//!
//! The trainer communicates through explicit callback parameters fed with
//! the record types below; no synchronization context is captured, the
//! caller decides where to receive them. Cancellation is a cooperative
//! token polled at batch and epoch boundaries, never preemptive, so a stop
//! request takes effect within one batch's compute time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cost and classification accuracy of one evaluation pass over a dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub cost: f32,
    /// Fraction of entities whose argmax matches the expected argmax.
    pub accuracy: f32,
}

/// Progress of one batch inside an epoch.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Zero-based batch index within the epoch.
    pub batch: usize,
    /// Total batches per epoch.
    pub batch_count: usize,
    /// Training cost of this batch.
    pub cost: f32,
}

/// Summary of one completed epoch.
#[derive(Debug, Clone)]
pub struct EpochReport {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Mean training cost over the epoch's batches.
    pub training_cost: f32,
    /// Validation score, when a validation dataset was supplied.
    pub validation: Option<Evaluation>,
    /// Test score, when a test dataset was supplied.
    pub test: Option<Evaluation>,
}

/// Terminal state of a training session that ran to an orderly stop.
///
/// Unrecoverable errors do not appear here; they surface as the `Err`
/// branch of [`train`](crate::trainer::train).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The configured epoch count was exhausted.
    Completed,
    /// The convergence criterion on the validation dataset was satisfied
    /// before the epoch count ran out.
    Converged,
    /// A cooperative cancellation request was observed.
    Cancelled,
}

/// The value returned by a training session.
#[derive(Debug, Clone)]
pub struct TrainingSessionResult {
    /// How the session ended.
    pub stop_reason: StopReason,
    /// One report per fully completed epoch.
    pub epochs: Vec<EpochReport>,
    /// Total number of batches processed across all epochs.
    pub batches_run: usize,
}

impl TrainingSessionResult {
    /// Number of fully completed epochs.
    pub fn epochs_run(&self) -> usize {
        self.epochs.len()
    }
}

/// A cooperative cancellation flag shared between the caller and the
/// training loop.
///
/// Cloning the token shares the underlying flag.
///
/// # Example
///
/// ```
/// use tensornet::CancellationToken;
///
/// let token = CancellationToken::new();
/// let observer = token.clone();
/// assert!(!observer.is_cancelled());
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. The training loop observes the request at its
    /// next batch or epoch boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shares_state_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_result_epoch_count() {
        let result = TrainingSessionResult {
            stop_reason: StopReason::Completed,
            epochs: vec![EpochReport {
                epoch: 0,
                training_cost: 1.0,
                validation: None,
                test: None,
            }],
            batches_run: 10,
        };
        assert_eq!(result.epochs_run(), 1);
    }
}
