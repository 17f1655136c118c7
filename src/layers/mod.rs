//! Layer abstractions and implementations
//!
//! This module provides the [`Layer`] trait, the concrete layer kinds, and
//! the binary persistence format shared by all of them.

mod r#trait;

pub mod conv;
pub mod dense;
pub mod pooling;
pub mod serialize;

pub use conv::ConvolutionalLayer;
pub use dense::DenseLayer;
pub use pooling::PoolingLayer;
pub use r#trait::{Layer, LayerGradient, LayerKind};
pub use serialize::{read_layer, write_layer};
