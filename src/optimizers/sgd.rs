//! Stochastic Gradient Descent (SGD) update rule
//!
//! `parameter = parameter - learning_rate * gradient`, applied to a tensor
//! whose gradient has already been averaged over the batch.

use crate::error::{NnError, Result};
use crate::tensor::Tensor;

/// Applies `param -= lr * avg_grad` in place.
///
/// # Errors
///
/// Returns [`NnError::ShapeMismatch`] if the two tensors differ in shape.
///
/// # Examples
///
/// ```
/// use ondevice_trainer::optimizers::sgd::sgd_step;
/// use ondevice_trainer::tensor::Tensor;
///
/// let mut params = Tensor::from_shape_vec((1, 1, 1, 3), vec![1.0, 2.0, 3.0]).unwrap();
/// let grads = Tensor::from_shape_vec((1, 1, 1, 3), vec![0.1, 0.2, 0.3]).unwrap();
/// sgd_step(&mut params, &grads, 0.1).unwrap();
/// assert!((params[[0, 0, 0, 0]] - 0.99).abs() < 1e-6);
/// ```
pub fn sgd_step(param: &mut Tensor, avg_grad: &Tensor, learning_rate: f32) -> Result<()> {
    if param.dim() != avg_grad.dim() {
        return Err(NnError::shape(param.dim(), avg_grad.dim()));
    }
    param.scaled_add(-learning_rate, avg_grad);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[f32]) -> Tensor {
        Tensor::from_shape_vec((1, 1, 1, values.len()), values.to_vec()).unwrap()
    }

    #[test]
    fn test_sgd_update() {
        let mut params = row(&[1.0, 2.0, 3.0]);
        sgd_step(&mut params, &row(&[0.1, 0.2, 0.3]), 0.1).unwrap();

        assert!((params[[0, 0, 0, 0]] - 0.99).abs() < 1e-6);
        assert!((params[[0, 0, 0, 1]] - 1.98).abs() < 1e-6);
        assert!((params[[0, 0, 0, 2]] - 2.97).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_negative_gradients() {
        let mut params = row(&[1.0, 2.0]);
        sgd_step(&mut params, &row(&[-0.5, -1.0]), 0.1).unwrap();

        // Negative gradients should increase parameters
        assert!((params[[0, 0, 0, 0]] - 1.05).abs() < 1e-6);
        assert!((params[[0, 0, 0, 1]] - 2.1).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_zero_learning_rate() {
        let mut params = row(&[1.0, 2.0, 3.0]);
        let original = params.clone();
        sgd_step(&mut params, &row(&[0.1, 0.2, 0.3]), 0.0).unwrap();
        assert_eq!(params, original);
    }

    #[test]
    fn test_sgd_mismatched_shapes() {
        let mut params = row(&[1.0, 2.0]);
        let result = sgd_step(&mut params, &row(&[0.1, 0.2, 0.3]), 0.01);
        assert!(matches!(result, Err(NnError::ShapeMismatch { .. })));
    }
}
