//! Batch normalization layer implementation
//!
//! Normalizes every (channel, row, column) element across the batch, then
//! applies a learnable scale (gamma) and shift (beta):
//!
//! 1. Batch statistics: mean μ and variance σ² over the batch axis
//! 2. Normalize: x̂ = (x - μ) / sqrt(σ² + ε)
//! 3. Scale and shift: y = γ * x̂ + β
//!
//! Training-mode forward also folds the batch statistics into running
//! estimates with a fixed momentum of 0.9; inference-mode forward uses the
//! running estimates and leaves them untouched.
//!
//! # References
//!
//! Ioffe, S., & Szegedy, C. (2015). Batch Normalization: Accelerating Deep Network Training
//! by Reducing Internal Covariate Shift. ICML.

use std::io::{Read, Write};

use ndarray::Axis;
use tracing::error;

use crate::error::{NnError, Result};
use crate::layers::{Layer, LayerBase};
use crate::optimizers::{Optimizer, OptimizerState};
use crate::properties::Property;
use crate::tensor::{read_tensor, sum_over_batch, write_tensor, Tensor, TensorDim};
use crate::utils::ActivationType;

const NAME: &str = "batch_normalization";

/// Weight of the previous running estimate in the moving average.
pub const MOMENTUM: f32 = 0.9;

/// Default ε added to the variance.
pub const DEFAULT_EPSILON: f32 = 0.001;

// Transient state handed from one training forward to the next backward.
struct BnCache {
    x_normalized: Tensor,
    cvar: Tensor,
    // Present only when an activation follows the affine transform.
    activated: Option<Tensor>,
}

/// Batch normalization layer with learnable scale and shift.
///
/// gamma, beta and the running statistics `mu`/`var` are all shaped
/// `(1, channel, height, width)`. Saved in that order: gamma, beta, mu, var.
///
/// # Example
///
/// ```
/// use ondevice_trainer::layers::{BatchNormalizationLayer, Layer};
/// use ondevice_trainer::optimizers::Optimizer;
/// use ondevice_trainer::tensor::{Tensor, TensorDim};
///
/// let mut bn = BatchNormalizationLayer::new();
/// bn.set_input_dim(TensorDim::new(4, 2, 1, 3));
/// bn.set_optimizer(&Optimizer::sgd(0.1).unwrap()).unwrap();
/// bn.initialize(false).unwrap();
///
/// let x = Tensor::from_shape_fn((4, 2, 1, 3), |(b, c, _, w)| (b * 3 + c + w) as f32);
/// let y = bn.forward(&x).unwrap();
/// assert_eq!(y.dim(), (4, 2, 1, 3));
/// assert_eq!(bn.parameter_count(), 12);
/// ```
pub struct BatchNormalizationLayer {
    base: LayerBase,
    epsilon: f32,
    gamma: Tensor,
    beta: Tensor,
    mu: Tensor,
    var: Tensor,
    opt_state: OptimizerState,
    cache: Option<BnCache>,
}

impl Default for BatchNormalizationLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchNormalizationLayer {
    pub fn new() -> Self {
        Self {
            base: LayerBase::default(),
            epsilon: DEFAULT_EPSILON,
            gamma: Tensor::zeros((0, 0, 0, 0)),
            beta: Tensor::zeros((0, 0, 0, 0)),
            mu: Tensor::zeros((0, 0, 0, 0)),
            var: Tensor::zeros((0, 0, 0, 0)),
            opt_state: OptimizerState::default(),
            cache: None,
        }
    }

    /// Creates a layer with a custom ε.
    ///
    /// # Errors
    ///
    /// [`NnError::InvalidParameter`] if `epsilon` is not positive.
    pub fn with_epsilon(epsilon: f32) -> Result<Self> {
        if epsilon <= 0.0 || epsilon.is_nan() {
            error!(epsilon, "epsilon must be positive");
            return Err(NnError::invalid(format!("epsilon must be positive ({})", epsilon)));
        }
        Ok(Self {
            epsilon,
            ..Self::new()
        })
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn momentum(&self) -> f32 {
        MOMENTUM
    }

    pub fn gamma(&self) -> &Tensor {
        &self.gamma
    }

    pub fn beta(&self) -> &Tensor {
        &self.beta
    }

    pub fn running_mean(&self) -> &Tensor {
        &self.mu
    }

    pub fn running_var(&self) -> &Tensor {
        &self.var
    }

    pub fn optimizer_state(&self) -> &OptimizerState {
        &self.opt_state
    }

    /// True while a training forward is waiting for its backward.
    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Copies configuration, parameters and running statistics from `other`.
    pub fn copy_from(&mut self, other: &BatchNormalizationLayer) {
        self.base = other.base.clone();
        self.epsilon = other.epsilon;
        self.gamma = other.gamma.clone();
        self.beta = other.beta.clone();
        self.mu = other.mu.clone();
        self.var = other.var.clone();
        self.opt_state = self.fresh_state().unwrap_or_default();
        self.cache = None;
    }

    fn feature_dim(&self) -> TensorDim {
        self.base.input_dim.with_batch(1)
    }

    fn fresh_state(&self) -> Result<OptimizerState> {
        if !self.base.initialized {
            return Ok(OptimizerState::default());
        }
        let dim = self.feature_dim();
        self.base.optimizer.initialize_pair(dim, dim, true)
    }

    fn inv_std(&self, variance: &Tensor) -> Tensor {
        let eps = self.epsilon;
        variance.mapv(|v| 1.0 / (v + eps).sqrt())
    }
}

impl Layer for BatchNormalizationLayer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn base(&self) -> &LayerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase {
        &mut self.base
    }

    fn initialize(&mut self, last: bool) -> Result<()> {
        self.base.begin_initialize(NAME, last)?;
        let dim = self.feature_dim();
        self.gamma = dim.filled(1.0);
        self.beta = dim.zeros();
        self.mu = dim.zeros();
        self.var = dim.zeros();
        self.base.finish_initialize(NAME, self.base.input_dim);
        self.opt_state = self.fresh_state()?;
        Ok(())
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.base.require_initialized(NAME)?;
        self.base.check_input(TensorDim::of(input))?;

        let mut output = if self.base.training {
            let mean = input
                .mean_axis(Axis(0))
                .ok_or_else(|| NnError::invalid("batch normalization needs a non-empty batch"))?
                .insert_axis(Axis(0));
            let centered = input - &mean;
            let cvar = centered
                .mapv(|v| v * v)
                .mean_axis(Axis(0))
                .ok_or_else(|| NnError::invalid("batch normalization needs a non-empty batch"))?
                .insert_axis(Axis(0));
            let x_normalized = &centered * &self.inv_std(&cvar);

            self.mu = &self.mu * MOMENTUM + &mean * (1.0 - MOMENTUM);
            self.var = &self.var * MOMENTUM + &cvar * (1.0 - MOMENTUM);

            let output = &x_normalized * &self.gamma + &self.beta;
            self.cache = Some(BnCache {
                x_normalized,
                cvar,
                activated: None,
            });
            output
        } else {
            self.cache = None;
            let x_normalized = (input - &self.mu) * &self.inv_std(&self.var);
            &x_normalized * &self.gamma + &self.beta
        };

        self.base.activation.apply_inplace(&mut output);
        if let Some(cache) = self.cache.as_mut() {
            if self.base.activation != ActivationType::None {
                cache.activated = Some(output.clone());
            }
        }
        Ok(output)
    }

    fn backward(&mut self, derivative: &Tensor, iteration: usize) -> Result<Tensor> {
        let cache = self.cache.take().ok_or_else(|| {
            error!(layer = NAME, "backward called without a preceding training forward");
            NnError::state("batch normalization backward requires a preceding training-mode forward")
        })?;
        if derivative.dim() != cache.x_normalized.dim() {
            return Err(NnError::shape(cache.x_normalized.dim(), derivative.dim()));
        }

        let mut delta = derivative.clone();
        if let Some(activated) = &cache.activated {
            self.base.activation.backprop_inplace(&mut delta, activated);
        }

        let n = delta.dim().0 as f32;
        let dbeta = sum_over_batch(&delta);
        let dgamma = sum_over_batch(&(&delta * &cache.x_normalized));

        // dx = (γ / (N·σ)) · (N·dy - Σdy - x̂·Σ(dy·x̂)), using γ before the update
        let scale = &self.gamma * &self.inv_std(&cache.cvar) / n;
        let mut dx = &delta * n - &dbeta;
        dx -= &(&cache.x_normalized * &dgamma);
        dx *= &scale;

        self.base.optimizer.update(
            &mut self.opt_state,
            dgamma,
            dbeta,
            &mut self.gamma,
            &mut self.beta,
            iteration,
            self.base.bias_init_zero,
            self.base.weight_decay,
        )?;
        Ok(dx)
    }

    fn read(&mut self, reader: &mut dyn Read) -> Result<()> {
        self.base.require_initialized(NAME)?;
        read_tensor(reader, &mut self.gamma)?;
        read_tensor(reader, &mut self.beta)?;
        read_tensor(reader, &mut self.mu)?;
        read_tensor(reader, &mut self.var)?;
        Ok(())
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        self.base.require_initialized(NAME)?;
        write_tensor(writer, &self.gamma)?;
        write_tensor(writer, &self.beta)?;
        write_tensor(writer, &self.mu)?;
        write_tensor(writer, &self.var)?;
        Ok(())
    }

    fn set_property(&mut self, values: &[&str]) -> Result<()> {
        for entry in values {
            let prop: Property = entry.parse()?;
            if !self.base.apply(&prop) {
                return Err(self.base.reject(NAME, &prop));
            }
        }
        Ok(())
    }

    fn copy(&self) -> Box<dyn Layer> {
        let mut layer = BatchNormalizationLayer::new();
        layer.copy_from(self);
        Box::new(layer)
    }

    fn set_optimizer(&mut self, optimizer: &Optimizer) -> Result<()> {
        self.base.optimizer = optimizer.clone();
        self.opt_state = self.fresh_state()?;
        Ok(())
    }

    fn parameter_count(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(dim: TensorDim) -> BatchNormalizationLayer {
        let mut bn = BatchNormalizationLayer::new();
        bn.set_input_dim(dim);
        bn.set_optimizer(&Optimizer::sgd(0.1).unwrap()).unwrap();
        bn.initialize(false).unwrap();
        bn
    }

    #[test]
    fn test_batchnorm_initialization() {
        let bn = layer(TensorDim::new(8, 3, 2, 2));
        assert!(bn.gamma().iter().all(|&v| v == 1.0));
        assert!(bn.beta().iter().all(|&v| v == 0.0));
        assert!(bn.running_mean().iter().all(|&v| v == 0.0));
        assert!(bn.running_var().iter().all(|&v| v == 0.0));
        assert_eq!(bn.gamma().dim(), (1, 3, 2, 2));
        assert_eq!(bn.output_dim(), TensorDim::new(8, 3, 2, 2));
        assert_eq!(bn.parameter_count(), 24);
    }

    #[test]
    fn test_batchnorm_invalid_epsilon() {
        assert!(BatchNormalizationLayer::with_epsilon(0.0).is_err());
        assert!(BatchNormalizationLayer::with_epsilon(-1e-5).is_err());
        assert_eq!(BatchNormalizationLayer::with_epsilon(1e-5).unwrap().epsilon(), 1e-5);
    }

    #[test]
    fn test_batchnorm_degenerate_input() {
        let mut bn = BatchNormalizationLayer::new();
        bn.set_input_dim(TensorDim::new(4, 0, 1, 1));
        bn.set_optimizer(&Optimizer::sgd(0.1).unwrap()).unwrap();
        assert!(matches!(bn.initialize(false), Err(NnError::InvalidParameter(_))));
    }

    #[test]
    fn test_batchnorm_forward_normalization() {
        let mut bn = layer(TensorDim::new(4, 1, 1, 2));
        let x = Tensor::from_shape_vec((4, 1, 1, 2), vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0])
            .unwrap();
        let y = bn.forward(&x).unwrap();

        for w in 0..2 {
            let column = y.slice(ndarray::s![.., 0, 0, w]);
            let mean = column.sum() / 4.0;
            let var = column.mapv(|v| (v - mean) * (v - mean)).sum() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-2);
        }
    }

    #[test]
    fn test_batchnorm_running_statistics_update() {
        let mut bn = layer(TensorDim::new(2, 1, 1, 1));
        let x = Tensor::from_shape_vec((2, 1, 1, 1), vec![2.0, 4.0]).unwrap();
        bn.forward(&x).unwrap();
        // mean 3, var 1
        assert!((bn.running_mean()[[0, 0, 0, 0]] - 0.3).abs() < 1e-6);
        assert!((bn.running_var()[[0, 0, 0, 0]] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_batchnorm_inference_uses_running_stats() {
        let mut bn = layer(TensorDim::new(2, 1, 1, 1));
        bn.set_training(false);
        let x = Tensor::from_shape_vec((2, 1, 1, 1), vec![2.0, 4.0]).unwrap();
        let y = bn.forward(&x).unwrap();
        // mu = 0, var = 0: y = x / sqrt(eps)
        let scale = 1.0 / DEFAULT_EPSILON.sqrt();
        assert!((y[[0, 0, 0, 0]] - 2.0 * scale).abs() < 1e-2);
        assert!(bn.running_mean().iter().all(|&v| v == 0.0));
        assert!(!bn.has_cache());
    }

    #[test]
    fn test_batchnorm_backward_requires_forward() {
        let mut bn = layer(TensorDim::new(2, 1, 1, 1));
        let grad = Tensor::ones((2, 1, 1, 1));
        assert!(matches!(bn.backward(&grad, 0), Err(NnError::InvalidState(_))));
    }

    #[test]
    fn test_batchnorm_backward_consumes_cache() {
        let mut bn = layer(TensorDim::new(2, 1, 1, 1));
        let x = Tensor::from_shape_vec((2, 1, 1, 1), vec![2.0, 4.0]).unwrap();
        bn.forward(&x).unwrap();
        assert!(bn.has_cache());
        let grad = Tensor::ones((2, 1, 1, 1));
        bn.backward(&grad, 0).unwrap();
        assert!(!bn.has_cache());
        assert!(bn.backward(&grad, 1).is_err());
    }

    #[test]
    fn test_batchnorm_uniform_gradient_gives_zero_input_gradient() {
        // A constant upstream gradient is absorbed entirely by beta.
        let mut bn = layer(TensorDim::new(3, 1, 1, 2));
        let x = Tensor::from_shape_fn((3, 1, 1, 2), |(b, _, _, w)| (b * 2 + w) as f32);
        bn.forward(&x).unwrap();
        let dx = bn.backward(&Tensor::ones((3, 1, 1, 2)), 0).unwrap();
        assert!(dx.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn test_batchnorm_rejects_layer_specific_keys() {
        let mut bn = BatchNormalizationLayer::new();
        assert!(bn.set_property(&["activation=relu"]).is_ok());
        assert!(matches!(
            bn.set_property(&["filters=3"]),
            Err(NnError::InvalidParameter(_))
        ));
    }
}
