//! Activation functions applied by layers after their linear transform.
//!
//! Derivatives are expressed in terms of the activation output, which is what
//! layers cache from the forward pass.

use std::str::FromStr;

use serde::Deserialize;

use crate::error::NnError;
use crate::tensor::Tensor;

/// Activation applied element-wise to a layer's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationType {
    #[default]
    None,
    Sigmoid,
    Relu,
    Tanh,
}

impl ActivationType {
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            ActivationType::None => x,
            ActivationType::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationType::Relu => x.max(0.0),
            ActivationType::Tanh => x.tanh(),
        }
    }

    /// Derivative at the point whose activation is `y`.
    pub fn derivative_from_output(&self, y: f32) -> f32 {
        match self {
            ActivationType::None => 1.0,
            ActivationType::Sigmoid => y * (1.0 - y),
            ActivationType::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActivationType::Tanh => 1.0 - y * y,
        }
    }

    pub fn apply_inplace(&self, tensor: &mut Tensor) {
        if *self != ActivationType::None {
            tensor.mapv_inplace(|x| self.apply(x));
        }
    }

    /// Multiplies `grad` by the activation derivative evaluated at `output`.
    pub fn backprop_inplace(&self, grad: &mut Tensor, output: &Tensor) {
        if *self == ActivationType::None {
            return;
        }
        ndarray::Zip::from(grad)
            .and(output)
            .for_each(|g, &y| *g *= self.derivative_from_output(y));
    }
}

impl FromStr for ActivationType {
    type Err = NnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ActivationType::None),
            "sigmoid" => Ok(ActivationType::Sigmoid),
            "relu" => Ok(ActivationType::Relu),
            "tanh" => Ok(ActivationType::Tanh),
            other => Err(NnError::invalid(format!("unknown activation '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON_F32: f32 = 1e-6;

    #[test]
    fn test_sigmoid_zero() {
        assert!((ActivationType::Sigmoid.apply(0.0) - 0.5).abs() < EPSILON_F32);
    }

    #[test]
    fn test_sigmoid_derivative_at_half() {
        let d = ActivationType::Sigmoid.derivative_from_output(0.5);
        assert!((d - 0.25).abs() < EPSILON_F32);
    }

    #[test]
    fn test_relu_mixed() {
        let mut data = Tensor::from_shape_vec((1, 1, 1, 5), vec![-2.0, -1.0, 0.0, 1.0, 2.0]).unwrap();
        ActivationType::Relu.apply_inplace(&mut data);
        assert_eq!(data.iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_relu_backprop_masks_inactive() {
        let out = Tensor::from_shape_vec((1, 1, 1, 3), vec![0.0, 2.0, 0.5]).unwrap();
        let mut grad = Tensor::from_elem((1, 1, 1, 3), 3.0);
        ActivationType::Relu.backprop_inplace(&mut grad, &out);
        assert_eq!(grad.iter().copied().collect::<Vec<_>>(), vec![0.0, 3.0, 3.0]);
    }

    #[test]
    fn test_tanh_derivative() {
        let y = ActivationType::Tanh.apply(0.3);
        let d = ActivationType::Tanh.derivative_from_output(y);
        assert!((d - (1.0 - 0.3f32.tanh().powi(2))).abs() < EPSILON_F32);
    }

    #[test]
    fn test_parse() {
        assert_eq!("ReLU".parse::<ActivationType>().unwrap(), ActivationType::Relu);
        assert!("softplus".parse::<ActivationType>().is_err());
    }
}
