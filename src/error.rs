//! Error types shared across the crate
//!
//! Argument and shape errors are programmer errors detected at the API
//! boundary and are never retried. Cancellation and convergence are normal
//! termination paths and are reported through
//! [`StopReason`](crate::progress::StopReason), not through this enum.
//! A truncated layer stream is reported by returning `None` from the
//! deserialization entry points rather than by an error value.

use thiserror::Error;

/// Errors surfaced by network construction, training and the accelerated
/// backend.
#[derive(Debug, Error)]
pub enum NetError {
    /// An out-of-range or otherwise unusable argument, rejected before any
    /// work begins (e.g. zero epochs, dropout outside `[0, 1)`).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Incompatible tensor or layer shapes, either between adjacent layers at
    /// network construction or between a batch and the network at train time.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The accelerated backend could not acquire a device-resident buffer
    /// within the context's budget. Always fatal to the current call; any
    /// buffers already acquired in that call's scope are released.
    #[error("device memory exhausted: requested {requested} floats with {in_use} in use, budget {budget}")]
    ResourceExhaustion {
        requested: usize,
        in_use: usize,
        budget: usize,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;

pub(crate) fn invalid_argument<S: Into<String>>(msg: S) -> NetError {
    NetError::InvalidArgument(msg.into())
}

pub(crate) fn shape_mismatch<S: Into<String>>(msg: S) -> NetError {
    NetError::ShapeMismatch(msg.into())
}
