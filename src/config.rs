//! Configuration structures for training and network construction
//!
//! JSON configuration enables experimentation without code changes: a
//! [`TrainingConfig`] carries the optimizer, schedule and loop parameters,
//! and a [`NetworkConfig`] describes the layer stack that
//! [`build_network`] turns into a [`SequentialNetwork`].
//!
//! # Example
//!
//! ```json
//! {
//!   "layers": [
//!     { "layer_type": "conv2d", "channels": 1, "height": 28, "width": 28,
//!       "kernels": 8, "kernel_size": 3, "padding": 1, "activation": "relu" },
//!     { "layer_type": "maxpool", "channels": 8, "height": 28, "width": 28,
//!       "window": 2 },
//!     { "layer_type": "dense", "input_size": 1568, "output_size": 10,
//!       "activation": "sigmoid" }
//!   ],
//!   "cost": "cross_entropy"
//! }
//! ```

use std::error::Error;
use std::fs;
use std::sync::Arc;

use rand::rngs::StdRng;
use serde::Deserialize;

use crate::activations::ActivationKind;
use crate::backend::Backend;
use crate::cost::CostKind;
use crate::layers::{ConvolutionalLayer, DenseLayer, Layer, PoolingLayer};
use crate::network::SequentialNetwork;
use crate::optimizers::{LearningRateSchedule, OptimizerConfig};
use crate::tensor::TensorShape;

fn config_error(message: String) -> Box<dyn Error> {
    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message))
}

/// Training loop parameters parsed from JSON.
///
/// Scheduler fields are required per `schedule` value: `step_decay` needs
/// `step_size` and `gamma`, `exponential` needs `decay_rate`.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    /// Optimizer: "sgd", "momentum" or "adagrad".
    pub optimizer: String,

    /// Base learning rate.
    pub learning_rate: f32,

    /// Momentum coefficient, for the momentum optimizer (default 0.9).
    pub momentum: Option<f32>,

    /// Schedule: "constant" (default), "step_decay" or "exponential".
    pub schedule: Option<String>,

    /// Epochs between rate reductions, for step decay.
    pub step_size: Option<usize>,

    /// Rate multiplier, for step decay.
    pub gamma: Option<f32>,

    /// Per-epoch rate multiplier, for exponential decay.
    pub decay_rate: Option<f32>,

    /// Number of training epochs.
    pub epochs: usize,

    /// Samples per batch.
    pub batch_size: usize,

    /// Dropout probability for fully connected activations (default 0).
    pub dropout: Option<f32>,

    /// Convergence tolerance when validating (default 1e-2).
    pub tolerance: Option<f32>,

    /// Convergence window in epochs when validating (default 5).
    pub window: Option<usize>,
}

impl TrainingConfig {
    /// Builds the optimizer configuration this file describes.
    pub fn optimizer_config(&self) -> Result<OptimizerConfig, Box<dyn Error>> {
        let schedule = match self.schedule.as_deref().unwrap_or("constant") {
            "constant" => LearningRateSchedule::Constant,
            "step_decay" => LearningRateSchedule::StepDecay {
                step_size: self
                    .step_size
                    .ok_or_else(|| config_error("step_decay requires 'step_size'".into()))?,
                gamma: self
                    .gamma
                    .ok_or_else(|| config_error("step_decay requires 'gamma'".into()))?,
            },
            "exponential" => LearningRateSchedule::ExponentialDecay {
                decay_rate: self
                    .decay_rate
                    .ok_or_else(|| config_error("exponential requires 'decay_rate'".into()))?,
            },
            other => {
                return Err(config_error(format!(
                    "unknown schedule '{}'; expected constant, step_decay or exponential",
                    other
                )))
            }
        };

        let config = match self.optimizer.to_lowercase().as_str() {
            "sgd" => OptimizerConfig::sgd(self.learning_rate),
            "momentum" => {
                OptimizerConfig::momentum(self.learning_rate, self.momentum.unwrap_or(0.9))
            }
            "adagrad" => OptimizerConfig::adagrad(self.learning_rate),
            other => {
                return Err(config_error(format!(
                    "unknown optimizer '{}'; expected sgd, momentum or adagrad",
                    other
                )))
            }
        };
        let config = config.with_schedule(schedule);
        config.validate().map_err(|e| config_error(e.to_string()))?;
        Ok(config)
    }
}

/// Loads a training configuration from a JSON file and validates it.
pub fn load_training_config(path: &str) -> Result<TrainingConfig, Box<dyn Error>> {
    let contents = fs::read_to_string(path)?;
    let config: TrainingConfig = serde_json::from_str(&contents)?;
    if config.epochs == 0 {
        return Err(config_error("epochs must be at least 1".into()));
    }
    if config.batch_size == 0 {
        return Err(config_error("batch_size must be at least 1".into()));
    }
    if let Some(dropout) = config.dropout {
        if !(0.0..1.0).contains(&dropout) {
            return Err(config_error(format!(
                "dropout {} is outside [0.0, 1.0)",
                dropout
            )));
        }
    }
    config.optimizer_config()?;
    Ok(config)
}

/// Configuration for a single layer in a [`NetworkConfig`].
///
/// Required fields depend on the layer type:
///
/// - **dense**: `input_size`, `output_size`
/// - **conv2d**: `channels`, `height`, `width`, `kernels`, `kernel_size`;
///   optional `stride` (default 1), `padding` (default 0)
/// - **maxpool**: `channels`, `height`, `width`, `window`; optional
///   `stride` (default: the window)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LayerConfig {
    /// Layer type: "dense", "conv2d" or "maxpool".
    pub layer_type: String,

    // Dense parameters
    pub input_size: Option<usize>,
    pub output_size: Option<usize>,

    // Spatial input shape for conv2d and maxpool
    pub channels: Option<usize>,
    pub height: Option<usize>,
    pub width: Option<usize>,

    // Conv2d parameters
    pub kernels: Option<usize>,
    pub kernel_size: Option<usize>,
    pub stride: Option<usize>,
    pub padding: Option<usize>,

    // Maxpool parameters
    pub window: Option<usize>,

    /// Activation: "identity", "sigmoid", "tanh", "relu" or "leaky_relu".
    /// Defaults to sigmoid for dense, relu for conv2d, identity for
    /// maxpool.
    pub activation: Option<String>,
}

/// Full network architecture parsed from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Layer stack, applied in order.
    pub layers: Vec<LayerConfig>,

    /// Cost function: "quadratic" (default) or "cross_entropy".
    pub cost: Option<String>,
}

/// Loads a network configuration from a JSON file.
pub fn load_network_config(path: &str) -> Result<NetworkConfig, Box<dyn Error>> {
    let contents = fs::read_to_string(path)?;
    let config: NetworkConfig = serde_json::from_str(&contents)?;
    Ok(config)
}

fn parse_activation(
    name: Option<&str>,
    default: ActivationKind,
) -> Result<ActivationKind, Box<dyn Error>> {
    match name {
        None => Ok(default),
        Some("identity") => Ok(ActivationKind::Identity),
        Some("sigmoid") => Ok(ActivationKind::Sigmoid),
        Some("tanh") => Ok(ActivationKind::Tanh),
        Some("relu") => Ok(ActivationKind::Relu),
        Some("leaky_relu") => Ok(ActivationKind::LeakyRelu),
        Some(other) => Err(config_error(format!(
            "unknown activation '{}'; expected identity, sigmoid, tanh, relu or leaky_relu",
            other
        ))),
    }
}

fn require(field: Option<usize>, layer: usize, name: &str) -> Result<usize, Box<dyn Error>> {
    field.ok_or_else(|| config_error(format!("layer {}: missing '{}'", layer, name)))
}

fn spatial_shape(layer: &LayerConfig, index: usize) -> Result<TensorShape, Box<dyn Error>> {
    Ok(TensorShape::new(
        require(layer.channels, index, "channels")?,
        require(layer.height, index, "height")?,
        require(layer.width, index, "width")?,
    ))
}

/// Builds a network from a configuration.
///
/// Each layer is initialized with the provided RNG; the layer chain is
/// validated by [`SequentialNetwork::new`], so incompatible adjacent
/// shapes are rejected here rather than at training time.
pub fn build_network(
    config: &NetworkConfig,
    backend: Arc<dyn Backend>,
    rng: &mut StdRng,
) -> Result<SequentialNetwork, Box<dyn Error>> {
    let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(config.layers.len());
    for (index, layer_config) in config.layers.iter().enumerate() {
        let layer: Box<dyn Layer> = match layer_config.layer_type.to_lowercase().as_str() {
            "dense" => {
                let activation =
                    parse_activation(layer_config.activation.as_deref(), ActivationKind::Sigmoid)?;
                Box::new(DenseLayer::new(
                    require(layer_config.input_size, index, "input_size")?,
                    require(layer_config.output_size, index, "output_size")?,
                    activation,
                    Arc::clone(&backend),
                    rng,
                ))
            }
            "conv2d" => {
                let activation =
                    parse_activation(layer_config.activation.as_deref(), ActivationKind::Relu)?;
                let kernel = require(layer_config.kernel_size, index, "kernel_size")?;
                Box::new(
                    ConvolutionalLayer::new(
                        spatial_shape(layer_config, index)?,
                        require(layer_config.kernels, index, "kernels")?,
                        (kernel, kernel),
                        layer_config.stride.unwrap_or(1),
                        layer_config.padding.unwrap_or(0),
                        activation,
                        Arc::clone(&backend),
                        rng,
                    )
                    .map_err(|e| config_error(format!("layer {}: {}", index, e)))?,
                )
            }
            "maxpool" => {
                let activation =
                    parse_activation(layer_config.activation.as_deref(), ActivationKind::Identity)?;
                let window = require(layer_config.window, index, "window")?;
                Box::new(
                    PoolingLayer::new(
                        spatial_shape(layer_config, index)?,
                        window,
                        layer_config.stride.unwrap_or(window),
                        activation,
                        Arc::clone(&backend),
                    )
                    .map_err(|e| config_error(format!("layer {}: {}", index, e)))?,
                )
            }
            other => {
                return Err(config_error(format!(
                    "layer {}: unknown layer type '{}'; expected dense, conv2d or maxpool",
                    index, other
                )))
            }
        };
        layers.push(layer);
    }

    let cost = match config.cost.as_deref() {
        None | Some("quadratic") => CostKind::Quadratic,
        Some("cross_entropy") => CostKind::CrossEntropy,
        Some(other) => {
            return Err(config_error(format!(
                "unknown cost '{}'; expected quadratic or cross_entropy",
                other
            )))
        }
    };

    SequentialNetwork::new(layers, cost).map_err(|e| config_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReferenceBackend;
    use rand::SeedableRng;

    fn base(layer_type: &str) -> LayerConfig {
        LayerConfig {
            layer_type: layer_type.to_string(),
            ..LayerConfig::default()
        }
    }

    #[test]
    fn test_build_dense_stack() {
        let config = NetworkConfig {
            layers: vec![
                LayerConfig {
                    input_size: Some(784),
                    output_size: Some(128),
                    ..base("dense")
                },
                LayerConfig {
                    input_size: Some(128),
                    output_size: Some(10),
                    ..base("dense")
                },
            ],
            cost: Some("cross_entropy".to_string()),
        };
        let mut rng = StdRng::seed_from_u64(42);
        let network =
            build_network(&config, Arc::new(ReferenceBackend::new()), &mut rng).unwrap();
        assert_eq!(network.layer_count(), 2);
        assert_eq!(network.cost(), CostKind::CrossEntropy);
    }

    #[test]
    fn test_build_conv_pool_dense() {
        let config = NetworkConfig {
            layers: vec![
                LayerConfig {
                    channels: Some(1),
                    height: Some(28),
                    width: Some(28),
                    kernels: Some(8),
                    kernel_size: Some(3),
                    padding: Some(1),
                    ..base("conv2d")
                },
                LayerConfig {
                    channels: Some(8),
                    height: Some(28),
                    width: Some(28),
                    window: Some(2),
                    ..base("maxpool")
                },
                LayerConfig {
                    input_size: Some(8 * 14 * 14),
                    output_size: Some(10),
                    ..base("dense")
                },
            ],
            cost: None,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let network =
            build_network(&config, Arc::new(ReferenceBackend::new()), &mut rng).unwrap();
        assert_eq!(network.layer_count(), 3);
        assert_eq!(network.output_shape(), TensorShape::linear(10));
    }

    #[test]
    fn test_missing_field_is_an_error() {
        let config = NetworkConfig {
            layers: vec![LayerConfig {
                input_size: Some(784),
                ..base("dense")
            }],
            cost: None,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let result = build_network(&config, Arc::new(ReferenceBackend::new()), &mut rng);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("output_size"));
    }

    #[test]
    fn test_unknown_layer_type_is_an_error() {
        let config = NetworkConfig {
            layers: vec![base("attention")],
            cost: None,
        };
        let mut rng = StdRng::seed_from_u64(42);
        assert!(build_network(&config, Arc::new(ReferenceBackend::new()), &mut rng).is_err());
    }

    #[test]
    fn test_mismatched_chain_is_an_error() {
        let config = NetworkConfig {
            layers: vec![
                LayerConfig {
                    input_size: Some(8),
                    output_size: Some(4),
                    ..base("dense")
                },
                LayerConfig {
                    input_size: Some(5),
                    output_size: Some(2),
                    ..base("dense")
                },
            ],
            cost: None,
        };
        let mut rng = StdRng::seed_from_u64(42);
        assert!(build_network(&config, Arc::new(ReferenceBackend::new()), &mut rng).is_err());
    }

    #[test]
    fn test_optimizer_config_parsing() {
        let config = TrainingConfig {
            optimizer: "momentum".to_string(),
            learning_rate: 0.05,
            momentum: Some(0.9),
            schedule: Some("step_decay".to_string()),
            step_size: Some(3),
            gamma: Some(0.5),
            decay_rate: None,
            epochs: 10,
            batch_size: 32,
            dropout: None,
            tolerance: None,
            window: None,
        };
        let optimizer = config.optimizer_config().unwrap();
        assert!((optimizer.learning_rate_for(0) - 0.05).abs() < 1e-7);
        assert!((optimizer.learning_rate_for(3) - 0.025).abs() < 1e-7);
    }

    #[test]
    fn test_unknown_optimizer_is_an_error() {
        let config = TrainingConfig {
            optimizer: "lbfgs".to_string(),
            learning_rate: 0.05,
            momentum: None,
            schedule: None,
            step_size: None,
            gamma: None,
            decay_rate: None,
            epochs: 10,
            batch_size: 32,
            dropout: None,
            tolerance: None,
            window: None,
        };
        assert!(config.optimizer_config().is_err());
    }
}
