//! Layer abstractions for neural networks
//!
//! This module provides the Layer trait, the configuration every layer
//! shares, and the trainable layer types.

mod r#trait;
pub mod base;
pub mod batchnorm;
pub mod conv2d;
pub mod conv_kernel;
pub mod transposed_conv2d;

// Re-export the Layer trait for convenience
pub use base::LayerBase;
pub use batchnorm::BatchNormalizationLayer;
pub use conv2d::Conv2DLayer;
pub use r#trait::Layer;
pub use transposed_conv2d::TransposedConv2dLayer;
