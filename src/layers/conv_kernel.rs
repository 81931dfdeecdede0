//! Correlation kernels shared by the convolution layers
//!
//! Both convolution layers relate a "large" spatial grid to a "small" one
//! through the same index map:
//!
//! ```text
//! large = small * stride + k * dilation - pad
//! ```
//!
//! For `Conv2DLayer` the input is large and the output is small. For
//! `TransposedConv2dLayer` it is the other way round. Three loops cover every
//! pass of both layers:
//!
//! | kernel                  | conv2d            | transposed conv2d |
//! |-------------------------|-------------------|-------------------|
//! | [`correlate`]           | forward           | input gradient    |
//! | [`correlate_transpose`] | input gradient    | forward           |
//! | [`filter_gradient`]     | filter gradient   | filter gradient   |
//!
//! Weights are always viewed as `(small_channels, large_channels, kh, kw)`.
//! Coordinates that fall outside the large grid read as zero and receive
//! nothing.

use ndarray::{Array5, ArrayView4};

use crate::tensor::Tensor;

/// Stride, dilation and leading padding of the index map, per (row, col).
///
/// `pad` may be negative when a transposed layer's output padding exceeds
/// its padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    pub pad: [isize; 2],
}

impl Geometry {
    #[inline]
    fn large_index(&self, axis: usize, small: usize, k: usize, extent: usize) -> Option<usize> {
        let pos = (small * self.stride[axis] + k * self.dilation[axis]) as isize - self.pad[axis];
        if pos >= 0 && (pos as usize) < extent {
            Some(pos as usize)
        } else {
            None
        }
    }
}

/// `small[b, s, y, x] = Σ large[b, l, Y, X] * w[s, l, ky, kx]`.
pub fn correlate(
    large: &Tensor,
    weights: ArrayView4<f32>,
    small_hw: (usize, usize),
    geom: Geometry,
) -> Tensor {
    let (batch, large_c, large_h, large_w) = large.dim();
    let (small_c, w_c, kh, kw) = weights.dim();
    debug_assert_eq!(w_c, large_c);
    let (small_h, small_w) = small_hw;

    let mut out = Tensor::zeros((batch, small_c, small_h, small_w));
    for b in 0..batch {
        for s in 0..small_c {
            for y in 0..small_h {
                for x in 0..small_w {
                    let mut sum = 0.0f32;
                    for ky in 0..kh {
                        let Some(ly) = geom.large_index(0, y, ky, large_h) else {
                            continue;
                        };
                        for kx in 0..kw {
                            let Some(lx) = geom.large_index(1, x, kx, large_w) else {
                                continue;
                            };
                            for l in 0..large_c {
                                sum += large[[b, l, ly, lx]] * weights[[s, l, ky, kx]];
                            }
                        }
                    }
                    out[[b, s, y, x]] = sum;
                }
            }
        }
    }
    out
}

/// Adjoint of [`correlate`]: scatters `small` back onto a large grid.
///
/// `large[b, l, Y, X] += small[b, s, y, x] * w[s, l, ky, kx]`.
pub fn correlate_transpose(
    small: &Tensor,
    weights: ArrayView4<f32>,
    large_hw: (usize, usize),
    geom: Geometry,
) -> Tensor {
    let (batch, small_c, small_h, small_w) = small.dim();
    let (w_s, large_c, kh, kw) = weights.dim();
    debug_assert_eq!(w_s, small_c);
    let (large_h, large_w) = large_hw;

    let mut out = Tensor::zeros((batch, large_c, large_h, large_w));
    for b in 0..batch {
        for s in 0..small_c {
            for y in 0..small_h {
                for x in 0..small_w {
                    let value = small[[b, s, y, x]];
                    if value == 0.0 {
                        continue;
                    }
                    for ky in 0..kh {
                        let Some(ly) = geom.large_index(0, y, ky, large_h) else {
                            continue;
                        };
                        for kx in 0..kw {
                            let Some(lx) = geom.large_index(1, x, kx, large_w) else {
                                continue;
                            };
                            for l in 0..large_c {
                                out[[b, l, ly, lx]] += value * weights[[s, l, ky, kx]];
                            }
                        }
                    }
                }
            }
        }
    }
    out
}

/// Per-sample weight gradient, shaped `(batch, small_c, large_c, kh, kw)`.
///
/// Callers sum over the batch axis.
/// Not averaged over the batch; the optimizer does that.
pub fn filter_gradient(
    large: &Tensor,
    small: &Tensor,
    kernel: [usize; 2],
    geom: Geometry,
) -> Array5<f32> {
    let (batch, large_c, large_h, large_w) = large.dim();
    let (small_b, small_c, small_h, small_w) = small.dim();
    debug_assert_eq!(batch, small_b);
    let [kh, kw] = kernel;

    let mut grad = Array5::<f32>::zeros((batch, small_c, large_c, kh, kw));
    for b in 0..batch {
        for s in 0..small_c {
            for y in 0..small_h {
                for x in 0..small_w {
                    let value = small[[b, s, y, x]];
                    if value == 0.0 {
                        continue;
                    }
                    for ky in 0..kh {
                        let Some(ly) = geom.large_index(0, y, ky, large_h) else {
                            continue;
                        };
                        for kx in 0..kw {
                            let Some(lx) = geom.large_index(1, x, kx, large_w) else {
                                continue;
                            };
                            for l in 0..large_c {
                                grad[[b, s, l, ky, kx]] += value * large[[b, l, ly, lx]];
                            }
                        }
                    }
                }
            }
        }
    }
    grad
}
