//! Adam (Adaptive Moment Estimation) moment tracking
//!
//! One [`AdamMoments`] pair tracks a single parameter tensor. The update rule,
//! with a zero-based `iteration` counter, is:
//!
//! ```text
//! m = β1 * m + (1 - β1) * g
//! v = β2 * v + (1 - β2) * g²
//! m_hat = m / (1 - β1^(iteration + 1))
//! v_hat = v / (1 - β2^(iteration + 1))
//! parameter = parameter - lr * m_hat / (√v_hat + ε)
//! ```
//!
//! The stored `m`/`v` are the biased estimates; the correction is applied
//! only to the step.
//!
//! # Reference
//!
//! Kingma, D. P., & Ba, J. (2014). Adam: A method for stochastic optimization.
//! arXiv preprint arXiv:1412.6980.

use ndarray::Zip;

use crate::error::{NnError, Result};
use crate::tensor::{Tensor, TensorDim};

/// Hyperparameters consumed by [`AdamMoments::step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamHyper {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl AdamHyper {
    /// `(1 - β1^(iteration+1), 1 - β2^(iteration+1))`.
    pub fn bias_corrections(&self, iteration: usize) -> (f64, f64) {
        let t = (iteration + 1) as f64;
        (1.0 - self.beta1.powf(t), 1.0 - self.beta2.powf(t))
    }
}

/// First and second moment estimates for one parameter tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct AdamMoments {
    m: Tensor,
    v: Tensor,
}

impl AdamMoments {
    /// Zero-filled moments shaped like `dim`.
    pub fn zeros(dim: TensorDim) -> Self {
        Self {
            m: dim.zeros(),
            v: dim.zeros(),
        }
    }

    /// Biased first moment estimate.
    pub fn first(&self) -> &Tensor {
        &self.m
    }

    /// Biased second moment estimate.
    pub fn second(&self) -> &Tensor {
        &self.v
    }

    pub fn dim(&self) -> TensorDim {
        TensorDim::of(&self.m)
    }

    /// Folds `avg_grad` into the moments and applies the bias-corrected step
    /// to `param`.
    pub fn step(
        &mut self,
        param: &mut Tensor,
        avg_grad: &Tensor,
        learning_rate: f32,
        hyper: &AdamHyper,
        iteration: usize,
    ) -> Result<()> {
        if param.dim() != self.m.dim() {
            return Err(NnError::shape(self.m.dim(), param.dim()));
        }
        if avg_grad.dim() != self.m.dim() {
            return Err(NnError::shape(self.m.dim(), avg_grad.dim()));
        }

        let (c1, c2) = hyper.bias_corrections(iteration);
        let (b1, b2) = (hyper.beta1 as f32, hyper.beta2 as f32);
        let (c1, c2, eps) = (c1 as f32, c2 as f32, hyper.epsilon as f32);

        Zip::from(param)
            .and(&mut self.m)
            .and(&mut self.v)
            .and(avg_grad)
            .for_each(|p, m, v, &g| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / c1;
                let v_hat = *v / c2;
                *p -= learning_rate * m_hat / (v_hat.sqrt() + eps);
            });
        Ok(())
    }
}
