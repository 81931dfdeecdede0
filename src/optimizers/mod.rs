//! Optimizer configuration and per-parameter update
//!
//! The optimizer is split in two:
//!
//! - [`Optimizer`]: the immutable policy (update rule, learning rate, betas,
//!   decay schedule). Layers keep their own copy.
//! - [`OptimizerState`]: the mutable Adam moment estimates for one
//!   weight/bias pair, created by [`Optimizer::initialize`] and owned by the
//!   layer that trains that pair.
//!
//! # Update algorithm
//!
//! [`Optimizer::update`] performs, in order:
//!
//! 1. coupled L2 weight decay (`grad_w += lambda * weight`) when enabled,
//! 2. the effective learning rate `lr * decay_rate^floor(iteration / decay_steps)`
//!    when a decay schedule is configured,
//! 3. averaging of both gradients over the batch axis,
//! 4. the SGD or Adam step,
//! 5. an additional plain SGD bias step when `bias_init_zero` is false.
//!
//! Step 5 runs on top of the Adam bias step as well. See `DESIGN.md`.
//!
//! # Example
//!
//! ```
//! use ondevice_trainer::optimizers::{OptType, Optimizer, WeightDecay};
//! use ondevice_trainer::tensor::TensorDim;
//!
//! let mut opt = Optimizer::default();
//! opt.set_type(OptType::Sgd).unwrap();
//! opt.set_property(&["learning_rate=0.1"]).unwrap();
//!
//! let dim = TensorDim::new(1, 1, 1, 2);
//! let mut state = opt.initialize(dim, true).unwrap();
//! let mut weight = dim.filled(1.0);
//! let mut bias = dim.zeros();
//! let grad_w = TensorDim::new(2, 1, 1, 2).filled(0.5);
//! let grad_b = TensorDim::new(2, 1, 1, 2).zeros();
//! opt.update(&mut state, grad_w, grad_b, &mut weight, &mut bias, 0, true, WeightDecay::none())
//!     .unwrap();
//! assert!((weight[[0, 0, 0, 0]] - 0.95).abs() < 1e-6);
//! ```

pub mod adam;
pub mod sgd;

use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::error::{NnError, Result};
use crate::properties::{parse_value, split_key_value};
use crate::tensor::{average_over_batch, Tensor, TensorDim};

pub use adam::{AdamHyper, AdamMoments};
pub use sgd::sgd_step;

/// Update rule selected by [`Optimizer::set_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptType {
    Sgd,
    Adam,
    /// Unset sentinel; rejected by `set_type`.
    #[default]
    Unknown,
}

/// Hyperparameters of the optimizer.
///
/// `decay_steps == -1` disables the learning-rate schedule.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct OptParam {
    pub learning_rate: f32,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub decay_rate: f32,
    pub decay_steps: f32,
}

impl Default for OptParam {
    fn default() -> Self {
        Self {
            learning_rate: 0.0,
            beta1: 0.0,
            beta2: 0.0,
            epsilon: 0.0,
            decay_rate: 0.0,
            decay_steps: -1.0,
        }
    }
}

impl OptParam {
    /// True when a step-decay schedule is configured.
    pub fn decay_enabled(&self) -> bool {
        self.decay_steps > 0.0
    }

    fn adam_hyper(&self) -> AdamHyper {
        AdamHyper {
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightDecayType {
    #[default]
    None,
    L2Norm,
}

impl FromStr for WeightDecayType {
    type Err = NnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(WeightDecayType::None),
            "l2norm" | "l2" => Ok(WeightDecayType::L2Norm),
            other => Err(NnError::invalid(format!("unknown weight decay '{}'", other))),
        }
    }
}

/// Weight regularization applied to the weight gradient before averaging.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WeightDecay {
    pub kind: WeightDecayType,
    pub lambda: f32,
}

impl WeightDecay {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn l2(lambda: f32) -> Self {
        Self {
            kind: WeightDecayType::L2Norm,
            lambda,
        }
    }
}

/// A parsed optimizer property.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerProperty {
    LearningRate(f32),
    DecaySteps(f32),
    DecayRate(f32),
    Beta1(f64),
    Beta2(f64),
    Epsilon(f64),
}

impl OptimizerProperty {
    fn apply(self, param: &mut OptParam) {
        match self {
            OptimizerProperty::LearningRate(v) => param.learning_rate = v,
            OptimizerProperty::DecaySteps(v) => param.decay_steps = v,
            OptimizerProperty::DecayRate(v) => param.decay_rate = v,
            OptimizerProperty::Beta1(v) => param.beta1 = v,
            OptimizerProperty::Beta2(v) => param.beta2 = v,
            OptimizerProperty::Epsilon(v) => param.epsilon = v,
        }
    }
}

impl FromStr for OptimizerProperty {
    type Err = NnError;

    fn from_str(entry: &str) -> Result<Self> {
        let (key, value) = split_key_value(entry)?;
        let key = key.as_str();
        match key {
            "learning_rate" => {
                let lr: f32 = parse_value(key, value)?;
                if lr <= 0.0 || lr.is_nan() {
                    error!(learning_rate = lr, "learning_rate should be greater than 0");
                    return Err(NnError::invalid(format!(
                        "learning_rate should be greater than 0 ({})",
                        lr
                    )));
                }
                Ok(OptimizerProperty::LearningRate(lr))
            }
            "decay_steps" => parse_value(key, value).map(OptimizerProperty::DecaySteps),
            "decay_rate" => parse_value(key, value).map(OptimizerProperty::DecayRate),
            "beta1" => parse_value(key, value).map(OptimizerProperty::Beta1),
            "beta2" => parse_value(key, value).map(OptimizerProperty::Beta2),
            "epsilon" => parse_value(key, value).map(OptimizerProperty::Epsilon),
            _ => {
                error!(key, "unknown optimizer property");
                Err(NnError::invalid(format!("unknown optimizer property '{}'", key)))
            }
        }
    }
}

/// Adam moment estimates for one weight/bias pair.
///
/// Empty for SGD, which keeps no state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizerState {
    weight: Option<AdamMoments>,
    bias: Option<AdamMoments>,
}

impl OptimizerState {
    pub fn is_allocated(&self) -> bool {
        self.weight.is_some() && self.bias.is_some()
    }

    pub fn wm(&self) -> Option<&Tensor> {
        self.weight.as_ref().map(AdamMoments::first)
    }

    pub fn wv(&self) -> Option<&Tensor> {
        self.weight.as_ref().map(AdamMoments::second)
    }

    pub fn bm(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(AdamMoments::first)
    }

    pub fn bv(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(AdamMoments::second)
    }
}

/// Optimizer policy: update rule plus hyperparameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Optimizer {
    kind: OptType,
    param: OptParam,
}

impl Optimizer {
    /// SGD with a fixed learning rate.
    pub fn sgd(learning_rate: f32) -> Result<Self> {
        let mut opt = Self::default();
        opt.set_type(OptType::Sgd)?;
        opt.set_param(OptParam {
            learning_rate,
            ..OptParam::default()
        })?;
        Ok(opt)
    }

    /// Adam with a fixed learning rate.
    pub fn adam(learning_rate: f32, beta1: f64, beta2: f64, epsilon: f64) -> Result<Self> {
        let mut opt = Self::default();
        opt.set_type(OptType::Adam)?;
        opt.set_param(OptParam {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            ..OptParam::default()
        })?;
        Ok(opt)
    }

    pub fn kind(&self) -> OptType {
        self.kind
    }

    pub fn param(&self) -> &OptParam {
        &self.param
    }

    /// Fixes the update rule.
    ///
    /// # Errors
    ///
    /// [`NnError::InvalidParameter`] for [`OptType::Unknown`].
    pub fn set_type(&mut self, kind: OptType) -> Result<()> {
        if kind == OptType::Unknown {
            error!("optimizer type is unknown");
            return Err(NnError::invalid("optimizer type is unknown"));
        }
        self.kind = kind;
        Ok(())
    }

    /// Replaces the hyperparameters.
    ///
    /// A decay schedule with only one of `decay_steps`/`decay_rate` set is
    /// accepted with a warning.
    ///
    /// # Errors
    ///
    /// [`NnError::InvalidParameter`] if `learning_rate <= 0`.
    pub fn set_param(&mut self, param: OptParam) -> Result<()> {
        if param.learning_rate <= 0.0 || param.learning_rate.is_nan() {
            error!(
                learning_rate = param.learning_rate,
                "learning_rate should be greater than 0"
            );
            return Err(NnError::invalid(format!(
                "learning_rate should be greater than 0 ({})",
                param.learning_rate
            )));
        }

        if param.decay_enabled() && param.decay_rate == 0.0 {
            warn!(
                decay_steps = param.decay_steps,
                "decay_steps is set without decay_rate; the learning rate drops to zero after the first decay step"
            );
        } else if !param.decay_enabled() && param.decay_rate != 0.0 {
            warn!(
                decay_rate = param.decay_rate,
                "decay_rate is set but decay_steps is not; no learning rate decay is applied"
            );
        }

        self.param = param;
        Ok(())
    }

    /// Applies `"key=value"` entries in order.
    ///
    /// Stops at the first invalid entry. Entries applied before it stay
    /// applied.
    pub fn set_property<S: AsRef<str>>(&mut self, values: &[S]) -> Result<()> {
        for entry in values {
            let prop: OptimizerProperty = entry.as_ref().parse()?;
            prop.apply(&mut self.param);
        }
        Ok(())
    }

    /// Creates state for a weight shaped `dim` and a bias shaped
    /// `(1, 1, 1, dim.width)`.
    ///
    /// Moments are allocated only for Adam and only when `allocate_state`.
    ///
    /// # Errors
    ///
    /// [`NnError::InvalidParameter`] if any dimension of `dim` is zero.
    pub fn initialize(&self, dim: TensorDim, allocate_state: bool) -> Result<OptimizerState> {
        let weight_dim = dim.with_batch(1);
        let bias_dim = TensorDim::new(1, 1, 1, dim.width);
        self.initialize_pair(weight_dim, bias_dim, allocate_state)
    }

    /// Creates state for an explicitly shaped weight/bias pair.
    pub fn initialize_pair(
        &self,
        weight_dim: TensorDim,
        bias_dim: TensorDim,
        allocate_state: bool,
    ) -> Result<OptimizerState> {
        if weight_dim.is_degenerate() || bias_dim.is_degenerate() {
            error!(%weight_dim, %bias_dim, "tensor dimension must be greater than 0");
            return Err(NnError::invalid(format!(
                "tensor dimension must be greater than 0 (weight {}, bias {})",
                weight_dim, bias_dim
            )));
        }

        if self.kind == OptType::Adam && allocate_state {
            debug!(%weight_dim, %bias_dim, "allocating adam moments");
            return Ok(OptimizerState {
                weight: Some(AdamMoments::zeros(weight_dim)),
                bias: Some(AdamMoments::zeros(bias_dim)),
            });
        }
        Ok(OptimizerState::default())
    }

    /// Learning rate after applying the decay schedule for `iteration`.
    pub fn learning_rate_at(&self, iteration: usize) -> f32 {
        let lr = self.param.learning_rate;
        if !self.param.decay_enabled() {
            return lr;
        }
        let steps = (iteration as f64 / self.param.decay_steps as f64).floor();
        (lr as f64 * (self.param.decay_rate as f64).powf(steps)) as f32
    }

    /// Updates `weight` and `bias` from batch gradients.
    ///
    /// `grad_w`/`grad_b` carry a leading batch axis and are averaged over it;
    /// `weight`/`bias` have a batch dimension of one. The conv layers sum
    /// their gradients over the batch first and pass a batch axis of one.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        state: &mut OptimizerState,
        mut grad_w: Tensor,
        grad_b: Tensor,
        weight: &mut Tensor,
        bias: &mut Tensor,
        iteration: usize,
        bias_init_zero: bool,
        weight_decay: WeightDecay,
    ) -> Result<()> {
        check_param_grad(weight, &grad_w)?;
        check_param_grad(bias, &grad_b)?;

        if weight_decay.kind == WeightDecayType::L2Norm {
            grad_w.scaled_add(weight_decay.lambda, &*weight);
        }

        let lr = self.learning_rate_at(iteration);
        let avg_grad_w = average_over_batch(&grad_w)?;
        let avg_grad_b = average_over_batch(&grad_b)?;

        match self.kind {
            OptType::Sgd => sgd_step(weight, &avg_grad_w, lr)?,
            OptType::Adam => {
                let hyper = self.param.adam_hyper();
                let (wmom, bmom) = match (state.weight.as_mut(), state.bias.as_mut()) {
                    (Some(w), Some(b)) => (w, b),
                    _ => {
                        return Err(NnError::state(
                            "adam update requested but optimizer state was not allocated",
                        ))
                    }
                };
                wmom.step(weight, &avg_grad_w, lr, &hyper, iteration)?;
                bmom.step(bias, &avg_grad_b, lr, &hyper, iteration)?;
            }
            OptType::Unknown => {
                return Err(NnError::state("optimizer type has not been set"));
            }
        }

        if !bias_init_zero {
            sgd_step(bias, &avg_grad_b, lr)?;
        }
        Ok(())
    }
}

/// A gradient must match its parameter except for the batch axis.
fn check_param_grad(param: &Tensor, grad: &Tensor) -> Result<()> {
    let (pb, pc, ph, pw) = param.dim();
    let (gb, gc, gh, gw) = grad.dim();
    if pb != 1 || (pc, ph, pw) != (gc, gh, gw) || gb == 0 {
        return Err(NnError::shape((1, pc, ph, pw), (gb, gc, gh, gw)));
    }
    Ok(())
}
