//! Dense tensor helpers
//!
//! Tensors are 4-D `f32` arrays laid out as (batch, channel, height, width).
//! This module adds the shape descriptor used during layer initialization,
//! the batch-axis reduction used by the optimizer, and the raw on-disk format
//! for parameters.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use ndarray::{Array4, Axis};

use crate::error::{NnError, Result};

/// Dense (batch, channel, height, width) array.
pub type Tensor = Array4<f32>;

/// Shape descriptor for a [`Tensor`].
///
/// All dimensions must be non-zero before anything is allocated against it;
/// see [`TensorDim::is_degenerate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TensorDim {
    pub batch: usize,
    pub channel: usize,
    pub height: usize,
    pub width: usize,
}

impl TensorDim {
    pub fn new(batch: usize, channel: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channel,
            height,
            width,
        }
    }

    /// Shape of a tensor.
    pub fn of(tensor: &Tensor) -> Self {
        let (b, c, h, w) = tensor.dim();
        Self::new(b, c, h, w)
    }

    /// True when any dimension is zero.
    pub fn is_degenerate(&self) -> bool {
        self.batch == 0 || self.channel == 0 || self.height == 0 || self.width == 0
    }

    /// Number of elements per sample (channel × height × width).
    pub fn feature_len(&self) -> usize {
        self.channel * self.height * self.width
    }

    pub fn len(&self) -> usize {
        self.batch * self.feature_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same shape with the batch dimension replaced.
    pub fn with_batch(&self, batch: usize) -> Self {
        Self { batch, ..*self }
    }

    pub fn shape(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.channel, self.height, self.width)
    }

    pub fn zeros(&self) -> Tensor {
        Tensor::zeros(self.shape())
    }

    pub fn filled(&self, value: f32) -> Tensor {
        Tensor::from_elem(self.shape(), value)
    }
}

impl fmt::Display for TensorDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.batch, self.channel, self.height, self.width
        )
    }
}

impl FromStr for TensorDim {
    type Err = NnError;

    /// Parses `"b:c:h:w"`. Shorter forms are right-aligned, so `"3:28:28"`
    /// means batch 1, channel 3.
    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split(':')
            .map(|p| {
                p.trim()
                    .parse::<usize>()
                    .map_err(|_| NnError::invalid(format!("bad dimension '{}' in '{}'", p, s)))
            })
            .collect::<Result<Vec<_>>>()?;
        if parts.is_empty() || parts.len() > 4 {
            return Err(NnError::invalid(format!(
                "expected 1 to 4 dimensions, got '{}'",
                s
            )));
        }
        let mut dims = [1usize; 4];
        dims[4 - parts.len()..].copy_from_slice(&parts);
        Ok(Self::new(dims[0], dims[1], dims[2], dims[3]))
    }
}

/// Mean over the batch axis, keeping a leading batch dimension of one.
pub fn average_over_batch(tensor: &Tensor) -> Result<Tensor> {
    tensor
        .mean_axis(Axis(0))
        .map(|mean| mean.insert_axis(Axis(0)))
        .ok_or_else(|| NnError::invalid("cannot average an empty batch"))
}

/// Sum over the batch axis, keeping a leading batch dimension of one.
pub fn sum_over_batch(tensor: &Tensor) -> Tensor {
    tensor.sum_axis(Axis(0)).insert_axis(Axis(0))
}

/// Writes the raw native-endian `f32` payload of `tensor`.
pub fn write_tensor(writer: &mut dyn Write, tensor: &Tensor) -> Result<()> {
    match tensor.as_slice() {
        Some(data) => writer.write_all(bytemuck::cast_slice(data))?,
        None => {
            let owned: Vec<f32> = tensor.iter().copied().collect();
            writer.write_all(bytemuck::cast_slice(&owned))?;
        }
    }
    Ok(())
}

/// Fills `tensor` from a raw native-endian `f32` payload.
///
/// The shape is taken from `tensor`; nothing in the stream describes it.
pub fn read_tensor(reader: &mut dyn Read, tensor: &mut Tensor) -> Result<()> {
    let mut data = vec![0.0f32; tensor.len()];
    reader.read_exact(bytemuck::cast_slice_mut(&mut data))?;
    for (dst, src) in tensor.iter_mut().zip(data) {
        *dst = src;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_dim() {
        let dim: TensorDim = "32:3:28:28".parse().unwrap();
        assert_eq!(dim, TensorDim::new(32, 3, 28, 28));
    }

    #[test]
    fn test_parse_short_dim_is_right_aligned() {
        let dim: TensorDim = "3:28:28".parse().unwrap();
        assert_eq!(dim, TensorDim::new(1, 3, 28, 28));
        let dim: TensorDim = "62720".parse().unwrap();
        assert_eq!(dim, TensorDim::new(1, 1, 1, 62720));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("a:b".parse::<TensorDim>().is_err());
        assert!("1:2:3:4:5".parse::<TensorDim>().is_err());
    }

    #[test]
    fn test_degenerate() {
        assert!(TensorDim::new(1, 0, 4, 4).is_degenerate());
        assert!(!TensorDim::new(1, 1, 1, 1).is_degenerate());
    }

    #[test]
    fn test_average_over_batch() {
        let t = Tensor::from_shape_vec((2, 1, 1, 2), vec![1.0, 2.0, 3.0, 6.0]).unwrap();
        let avg = average_over_batch(&t).unwrap();
        assert_eq!(avg.dim(), (1, 1, 1, 2));
        assert_eq!(avg[[0, 0, 0, 0]], 2.0);
        assert_eq!(avg[[0, 0, 0, 1]], 4.0);
    }

    #[test]
    fn test_average_empty_batch_fails() {
        let t = Tensor::zeros((0, 1, 1, 2));
        assert!(average_over_batch(&t).is_err());
    }

    #[test]
    fn test_raw_payload_is_headerless() {
        let t = TensorDim::new(1, 2, 2, 2).filled(0.5);
        let mut bytes = Vec::new();
        write_tensor(&mut bytes, &t).unwrap();
        assert_eq!(bytes.len(), 8 * std::mem::size_of::<f32>());

        let mut back = TensorDim::new(1, 2, 2, 2).zeros();
        read_tensor(&mut bytes.as_slice(), &mut back).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_read_truncated_payload_fails() {
        let bytes = vec![0u8; 6];
        let mut t = TensorDim::new(1, 1, 1, 2).zeros();
        assert!(read_tensor(&mut bytes.as_slice(), &mut t).is_err());
    }
}
