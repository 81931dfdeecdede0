//! Layer trait definition for neural network layers
//!
//! This module defines the core Layer trait that all layer types implement.
//! A training driver sequences `Box<dyn Layer>` values and never needs the
//! concrete type.

use std::io::{Read, Write};

use crate::error::Result;
use crate::layers::LayerBase;
use crate::optimizers::Optimizer;
use crate::tensor::{Tensor, TensorDim};

/// Core trait for neural network layers.
///
/// # Lifecycle
///
/// 1. configure with [`set_property`](Layer::set_property),
///    [`set_input_dim`](Layer::set_input_dim) and
///    [`set_optimizer`](Layer::set_optimizer);
/// 2. call [`initialize`](Layer::initialize) exactly once;
/// 3. alternate [`forward`](Layer::forward) and [`backward`](Layer::backward).
///
/// Each `backward` consumes the cache written by the `forward` right before
/// it. A second `backward`, or a `backward` without a training-mode
/// `forward`, fails with [`NnError::InvalidState`](crate::NnError::InvalidState).
///
/// # Example
///
/// ```ignore
/// let out = layer.forward(&input)?;
/// let grad_input = layer.backward(&grad_out, iteration)?;
/// ```
pub trait Layer {
    /// Short type name used in logs and errors.
    fn name(&self) -> &'static str;

    fn base(&self) -> &LayerBase;

    fn base_mut(&mut self) -> &mut LayerBase;

    /// Allocates parameters against the configured input shape.
    ///
    /// # Errors
    ///
    /// - [`NnError::InvalidParameter`](crate::NnError::InvalidParameter) for a
    ///   degenerate input shape or inconsistent layer configuration
    /// - [`NnError::InvalidState`](crate::NnError::InvalidState) if called twice
    fn initialize(&mut self, last: bool) -> Result<()>;

    /// Forward propagation.
    ///
    /// In training mode the layer caches what its next `backward` needs.
    fn forward(&mut self, input: &Tensor) -> Result<Tensor>;

    /// Forward propagation with a label, for layers that consume one.
    fn forward_with_label(&mut self, input: &Tensor, _label: &Tensor) -> Result<Tensor> {
        self.forward(input)
    }

    /// Backward propagation.
    ///
    /// Computes parameter gradients from `derivative` (gradient w.r.t. this
    /// layer's output), updates the parameters through the attached
    /// optimizer, and returns the gradient w.r.t. this layer's input.
    /// `iteration` is zero-based.
    fn backward(&mut self, derivative: &Tensor, iteration: usize) -> Result<Tensor>;

    /// Restores parameters written by [`save`](Layer::save).
    ///
    /// The layer must be initialized with the same shapes that were saved.
    fn read(&mut self, reader: &mut dyn Read) -> Result<()>;

    /// Writes parameters as raw `f32` payloads in declaration order.
    fn save(&self, writer: &mut dyn Write) -> Result<()>;

    /// Applies `"key=value"` entries, stopping at the first invalid one.
    fn set_property(&mut self, values: &[&str]) -> Result<()>;

    /// Deep copy of configuration and parameters.
    ///
    /// Optimizer moment estimates and forward caches are not copied; the copy
    /// starts with fresh optimizer state.
    fn copy(&self) -> Box<dyn Layer>;

    /// Attaches an optimizer policy, resetting any optimizer state.
    fn set_optimizer(&mut self, optimizer: &Optimizer) -> Result<()>;

    /// Number of trainable scalars.
    fn parameter_count(&self) -> usize;

    fn set_input_dim(&mut self, dim: TensorDim) {
        self.base_mut().input_dim = dim;
    }

    fn input_dim(&self) -> TensorDim {
        self.base().input_dim()
    }

    fn output_dim(&self) -> TensorDim {
        self.base().output_dim()
    }

    /// Switches between training (batch statistics, caching) and inference.
    fn set_training(&mut self, training: bool) {
        self.base_mut().training = training;
    }

    fn is_training(&self) -> bool {
        self.base().is_training()
    }
}
