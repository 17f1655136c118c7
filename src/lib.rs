//! Dual-backend neural network training engine
//!
//! This library trains feed-forward and convolutional networks: it composes
//! layers into a [`SequentialNetwork`], drives mini-batch gradient descent
//! across epochs, and produces numerically consistent results whether the
//! layer arithmetic runs on the sequential [`ReferenceBackend`] or the
//! data-parallel [`AcceleratedBackend`].
//!
//! # Modules
//!
//! - `tensor`: dense buffers, shapes and the scratch pool
//! - `activations` / `cost`: elementwise activations and cost functions
//! - `backend`: the kernel contract and its two implementations
//! - `layers`: the layer contract, concrete kinds and binary persistence
//! - `network`: sequential composition, forward/backward, evaluation
//! - `dataset`: batch sources for training, validation and testing
//! - `optimizers`: update rules and learning-rate schedules
//! - `trainer`: the epoch/batch orchestration loop
//! - `config`: JSON configuration for networks and training runs
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rand::{rngs::StdRng, SeedableRng};
//! use tensornet::{
//!     train, ActivationKind, BatchSet, CancellationToken, CostKind, DenseLayer,
//!     OptimizerConfig, ReferenceBackend, SequentialNetwork, StopReason, TensorShape,
//! };
//!
//! let backend: Arc<dyn tensornet::Backend> = Arc::new(ReferenceBackend::new());
//! let mut rng = StdRng::seed_from_u64(42);
//! let mut network = SequentialNetwork::new(
//!     vec![
//!         Box::new(DenseLayer::new(2, 8, ActivationKind::Tanh, Arc::clone(&backend), &mut rng)),
//!         Box::new(DenseLayer::new(8, 1, ActivationKind::Sigmoid, backend, &mut rng)),
//!     ],
//!     CostKind::Quadratic,
//! )
//! .unwrap();
//!
//! let dataset = BatchSet::new(
//!     TensorShape::linear(2),
//!     TensorShape::linear(1),
//!     vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0],
//!     vec![0.0, 1.0, 1.0, 0.0],
//!     4,
//! )
//! .unwrap();
//!
//! let result = train(
//!     &mut network,
//!     &dataset,
//!     &OptimizerConfig::sgd(0.5),
//!     10,
//!     0.0,
//!     None,
//!     None,
//!     None,
//!     None,
//!     &CancellationToken::new(),
//! )
//! .unwrap();
//! assert_eq!(result.stop_reason, StopReason::Completed);
//! assert_eq!(result.epochs_run(), 10);
//! ```

pub mod activations;
pub mod backend;
pub mod config;
pub mod cost;
pub mod dataset;
pub mod error;
pub mod layers;
pub mod network;
pub mod optimizers;
pub mod progress;
pub mod tensor;
pub mod trainer;

pub use activations::ActivationKind;
pub use backend::{AcceleratedBackend, Backend, DeviceContext, ReferenceBackend};
pub use config::{build_network, load_network_config, load_training_config};
pub use cost::CostKind;
pub use dataset::{BatchSet, BatchSource, ValidationSet};
pub use error::{NetError, Result};
pub use layers::{
    read_layer, write_layer, ConvolutionalLayer, DenseLayer, Layer, LayerGradient, LayerKind,
    PoolingLayer,
};
pub use network::{ForwardTrace, SequentialNetwork};
pub use optimizers::{LearningRateSchedule, Optimizer, OptimizerConfig};
pub use progress::{
    BatchProgress, CancellationToken, EpochReport, Evaluation, StopReason, TrainingSessionResult,
};
pub use tensor::{Tensor, TensorPool, TensorShape};
pub use trainer::{train, train_background};
