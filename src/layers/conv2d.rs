//! 2D Convolutional layer implementation
//!
//! This module provides a Conv2DLayer that performs 2D cross-correlation over
//! (batch, channel, height, width) tensors, with one bias per output channel
//! and an optional activation.

use std::io::{Read, Write};

use ndarray::{concatenate, s, Axis};
use tracing::error;

use crate::error::{NnError, Result};
use crate::layers::conv_kernel::{correlate, correlate_transpose, filter_gradient, Geometry};
use crate::layers::{Layer, LayerBase};
use crate::optimizers::{Optimizer, OptimizerState};
use crate::properties::{Padding2D, PaddingType, Property};
use crate::tensor::{read_tensor, write_tensor, Tensor, TensorDim};
use crate::utils::SimpleRng;

const NAME: &str = "conv2d";

/// Output size and (before, after) padding along one spatial axis.
///
/// - `valid`: no padding; the input must be at least as large as the kernel.
/// - `same`: output is `ceil(input / stride)`, and
///   `pad_total = (output - 1) * stride + kernel - input` (clamped at zero)
///   is split with the smaller half first.
/// - `full`: `kernel - 1` on each side.
///
/// # Errors
///
/// [`NnError::InvalidParameter`] for [`PaddingType::Unknown`], a zero kernel
/// or stride, or a kernel larger than the padded input.
///
/// # Example
///
/// ```
/// use ondevice_trainer::layers::conv2d::conv_output_size;
/// use ondevice_trainer::properties::PaddingType;
///
/// assert_eq!(conv_output_size(32, 3, 1, PaddingType::Same).unwrap(), (32, 1, 1));
/// assert_eq!(conv_output_size(32, 3, 1, PaddingType::Valid).unwrap(), (30, 0, 0));
/// ```
pub fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: PaddingType,
) -> Result<(usize, usize, usize)> {
    if kernel == 0 || stride == 0 {
        return Err(NnError::invalid(format!(
            "kernel ({}) and stride ({}) must be greater than 0",
            kernel, stride
        )));
    }
    let (before, after) = match padding {
        PaddingType::Valid => (0, 0),
        PaddingType::Same => {
            let output = (input + stride - 1) / stride;
            let total = ((output.saturating_sub(1)) * stride + kernel).saturating_sub(input);
            (total / 2, total - total / 2)
        }
        PaddingType::Full => (kernel - 1, kernel - 1),
        PaddingType::Unknown => {
            error!("unknown padding type");
            return Err(NnError::invalid("unknown padding type"));
        }
    };
    padded_output_size(input, kernel, stride, before, after)
}

fn padded_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    before: usize,
    after: usize,
) -> Result<(usize, usize, usize)> {
    let padded = input + before + after;
    if padded < kernel {
        error!(input, kernel, before, after, "kernel is larger than the padded input");
        return Err(NnError::invalid(format!(
            "kernel {} is larger than padded input {}",
            kernel, padded
        )));
    }
    Ok(((padded - kernel) / stride + 1, before, after))
}

struct ConvCache {
    input: Tensor,
    output: Tensor,
}

/// 2D convolution layer with `filters` learnable kernels.
///
/// Each filter is a `(1, in_channels, kh, kw)` tensor with a `(1, 1, 1, 1)`
/// bias. Forward output channel `f` is the cross-correlation of the padded
/// input with filter `f` plus bias `f`, then the activation.
///
/// # Properties
///
/// `filters`, `kernel_size`, `stride` (default `1,1`), `padding`
/// (`valid` | `same` | `full` | `t,b,l,r`, default `valid`), plus the common
/// layer keys.
///
/// # Example
///
/// ```
/// use ondevice_trainer::layers::{Conv2DLayer, Layer};
/// use ondevice_trainer::optimizers::Optimizer;
/// use ondevice_trainer::tensor::TensorDim;
///
/// let mut conv = Conv2DLayer::new();
/// conv.set_property(&["input_shape=2:3:32:32", "filters=8", "kernel_size=3,3", "padding=same"])
///     .unwrap();
/// conv.set_optimizer(&Optimizer::sgd(0.01).unwrap()).unwrap();
/// conv.initialize(false).unwrap();
/// assert_eq!(conv.output_dim(), TensorDim::new(2, 8, 32, 32));
/// ```
pub struct Conv2DLayer {
    base: LayerBase,
    filter_size: usize,
    kernel_size: [usize; 2],
    stride: [usize; 2],
    padding: Padding2D,
    /// Resolved (top, bottom, left, right) padding.
    pad: [usize; 4],
    filters: Vec<Tensor>,
    biases: Vec<Tensor>,
    opt_states: Vec<OptimizerState>,
    cache: Option<ConvCache>,
}

impl Default for Conv2DLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Conv2DLayer {
    pub fn new() -> Self {
        Self {
            base: LayerBase::default(),
            filter_size: 0,
            kernel_size: [0, 0],
            stride: [1, 1],
            padding: Padding2D::default(),
            pad: [0; 4],
            filters: Vec::new(),
            biases: Vec::new(),
            opt_states: Vec::new(),
            cache: None,
        }
    }

    /// Seed for the weight initializer.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.base.seed = seed;
        self
    }

    pub fn filter_size(&self) -> usize {
        self.filter_size
    }

    pub fn kernel_size(&self) -> [usize; 2] {
        self.kernel_size
    }

    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }

    /// Resolved (top, bottom, left, right) padding; zero before `initialize`.
    pub fn pad(&self) -> [usize; 4] {
        self.pad
    }

    pub fn filters(&self) -> &[Tensor] {
        &self.filters
    }

    /// Mutable access to the filters, e.g. to load externally trained values.
    pub fn filters_mut(&mut self) -> &mut [Tensor] {
        &mut self.filters
    }

    pub fn biases(&self) -> &[Tensor] {
        &self.biases
    }

    pub fn biases_mut(&mut self) -> &mut [Tensor] {
        &mut self.biases
    }

    pub fn optimizer_states(&self) -> &[OptimizerState] {
        &self.opt_states
    }

    /// Copies configuration and parameters from `other`.
    ///
    /// Optimizer state is re-created empty for the copied shapes and the
    /// forward cache is dropped.
    pub fn copy_from(&mut self, other: &Conv2DLayer) {
        self.base = other.base.clone();
        self.filter_size = other.filter_size;
        self.kernel_size = other.kernel_size;
        self.stride = other.stride;
        self.padding = other.padding;
        self.pad = other.pad;
        self.filters = other.filters.clone();
        self.biases = other.biases.clone();
        self.opt_states = self.fresh_states().unwrap_or_default();
        self.cache = None;
    }

    fn geometry(&self) -> Geometry {
        Geometry {
            stride: self.stride,
            dilation: [1, 1],
            pad: [self.pad[0] as isize, self.pad[2] as isize],
        }
    }

    /// Filters stacked as `(filters, in_channels, kh, kw)`.
    fn stacked_filters(&self) -> Result<Tensor> {
        let views: Vec<_> = self.filters.iter().map(|f| f.view()).collect();
        concatenate(Axis(0), &views).map_err(|e| NnError::state(format!("cannot stack filters: {}", e)))
    }

    fn filter_dim(&self) -> TensorDim {
        TensorDim::new(
            1,
            self.base.input_dim.channel,
            self.kernel_size[0],
            self.kernel_size[1],
        )
    }

    fn fresh_states(&self) -> Result<Vec<OptimizerState>> {
        if !self.base.initialized {
            return Ok(Vec::new());
        }
        let filter_dim = self.filter_dim();
        let bias_dim = TensorDim::new(1, 1, 1, 1);
        (0..self.filter_size)
            .map(|_| {
                self.base
                    .optimizer
                    .initialize_pair(filter_dim, bias_dim, true)
            })
            .collect()
    }

    fn resolve_padding(&self) -> Result<([usize; 4], usize, usize)> {
        let input = self.base.input_dim;
        let [kh, kw] = self.kernel_size;
        let [sh, sw] = self.stride;
        let ((oh, top, bottom), (ow, left, right)) = match self.padding {
            Padding2D::Mode(mode) => (
                conv_output_size(input.height, kh, sh, mode)?,
                conv_output_size(input.width, kw, sw, mode)?,
            ),
            Padding2D::Explicit([t, b, l, r]) => {
                if sh == 0 || sw == 0 {
                    return Err(NnError::invalid("stride must be greater than 0"));
                }
                (
                    padded_output_size(input.height, kh, sh, t, b)?,
                    padded_output_size(input.width, kw, sw, l, r)?,
                )
            }
        };
        Ok(([top, bottom, left, right], oh, ow))
    }
}

impl Layer for Conv2DLayer {
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
        if self.filter_size == 0 || self.kernel_size.contains(&0) {
            error!(
                filters = self.filter_size,
                kernel_h = self.kernel_size[0],
                kernel_w = self.kernel_size[1],
                "filters and kernel_size must be greater than 0"
            );
            return Err(NnError::invalid(format!(
                "conv2d needs filters > 0 and kernel_size > 0 (filters {}, kernel {:?})",
                self.filter_size, self.kernel_size
            )));
        }

        let (pad, oh, ow) = self.resolve_padding()?;
        self.pad = pad;

        let input = self.base.input_dim;
        let filter_dim = self.filter_dim();
        let fan_in = filter_dim.feature_len();
        let fan_out = self.filter_size * self.kernel_size[0] * self.kernel_size[1];
        let mut rng = SimpleRng::new(self.base.seed);

        self.filters = (0..self.filter_size)
            .map(|_| {
                let mut filter = filter_dim.zeros();
                self.base.weight_init.fill(&mut filter, fan_in, fan_out, &mut rng);
                filter
            })
            .collect();
        self.biases = (0..self.filter_size)
            .map(|_| {
                let mut bias = Tensor::zeros((1, 1, 1, 1));
                if !self.base.bias_init_zero {
                    self.base.weight_init.fill(&mut bias, fan_in, fan_out, &mut rng);
                }
                bias
            })
            .collect();

        let output = TensorDim::new(input.batch, self.filter_size, oh, ow);
        self.base.finish_initialize(NAME, output);
        self.opt_states = self.fresh_states()?;
        Ok(())
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.base.require_initialized(NAME)?;
        self.base.check_input(TensorDim::of(input))?;

        let out_dim = self.base.output_dim;
        let weights = self.stacked_filters()?;
        let mut output = correlate(
            input,
            weights.view(),
            (out_dim.height, out_dim.width),
            self.geometry(),
        );
        for (f, bias) in self.biases.iter().enumerate() {
            let b = bias[[0, 0, 0, 0]];
            output.slice_mut(s![.., f, .., ..]).mapv_inplace(|v| v + b);
        }
        self.base.activation.apply_inplace(&mut output);

        self.cache = if self.base.training {
            Some(ConvCache {
                input: input.clone(),
                output: output.clone(),
            })
        } else {
            None
        };
        Ok(output)
    }

    fn backward(&mut self, derivative: &Tensor, iteration: usize) -> Result<Tensor> {
        let cache = self.cache.take().ok_or_else(|| {
            error!(layer = NAME, "backward called without a preceding training forward");
            NnError::state("conv2d backward requires a preceding training-mode forward")
        })?;
        if derivative.dim() != cache.output.dim() {
            return Err(NnError::shape(cache.output.dim(), derivative.dim()));
        }

        let mut delta = derivative.clone();
        self.base.activation.backprop_inplace(&mut delta, &cache.output);

        let geom = self.geometry();
        let (_, _, in_h, in_w) = cache.input.dim();
        // Input gradient uses the weights from before this update.
        let weights = self.stacked_filters()?;
        let grad_input = correlate_transpose(&delta, weights.view(), (in_h, in_w), geom);
        let grad_filters = filter_gradient(&cache.input, &delta, self.kernel_size, geom);

        // Parameter gradients are summed over the batch, as batch norm does.
        let summed = grad_filters.sum_axis(Axis(0));
        for f in 0..self.filter_size {
            let grad_w = summed.index_axis(Axis(0), f).to_owned().insert_axis(Axis(0));
            let grad_b = Tensor::from_elem((1, 1, 1, 1), delta.index_axis(Axis(1), f).sum());
            self.base.optimizer.update(
                &mut self.opt_states[f],
                grad_w,
                grad_b,
                &mut self.filters[f],
                &mut self.biases[f],
                iteration,
                self.base.bias_init_zero,
                self.base.weight_decay,
            )?;
        }
        Ok(grad_input)
    }

    fn read(&mut self, reader: &mut dyn Read) -> Result<()> {
        self.base.require_initialized(NAME)?;
        for filter in self.filters.iter_mut() {
            read_tensor(reader, filter)?;
        }
        for bias in self.biases.iter_mut() {
            read_tensor(reader, bias)?;
        }
        Ok(())
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        self.base.require_initialized(NAME)?;
        for filter in &self.filters {
            write_tensor(writer, filter)?;
        }
        for bias in &self.biases {
            write_tensor(writer, bias)?;
        }
        Ok(())
    }

    fn set_property(&mut self, values: &[&str]) -> Result<()> {
        for entry in values {
            let prop: Property = entry.parse()?;
            match prop {
                Property::Filters(n) => self.filter_size = n,
                Property::KernelSize(k) => self.kernel_size = k,
                Property::Stride(st) => self.stride = st,
                Property::Padding(p) => self.padding = p,
                ref other => {
                    if !self.base.apply(other) {
                        return Err(self.base.reject(NAME, other));
                    }
                }
            }
        }
        Ok(())
    }

    fn copy(&self) -> Box<dyn Layer> {
        let mut layer = Conv2DLayer::new();
        layer.copy_from(self);
        Box::new(layer)
    }

    fn set_optimizer(&mut self, optimizer: &Optimizer) -> Result<()> {
        self.base.optimizer = optimizer.clone();
        self.opt_states = self.fresh_states()?;
        Ok(())
    }

    fn parameter_count(&self) -> usize {
        self.filters.iter().map(|f| f.len()).sum::<usize>() + self.biases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizers::OptType;

    fn layer(props: &[&str]) -> Conv2DLayer {
        let mut conv = Conv2DLayer::new();
        conv.set_property(props).unwrap();
        conv.set_optimizer(&Optimizer::sgd(0.1).unwrap()).unwrap();
        conv.initialize(false).unwrap();
        conv
    }

    #[test]
    fn test_output_size_modes() {
        assert_eq!(conv_output_size(32, 3, 1, PaddingType::Same).unwrap(), (32, 1, 1));
        assert_eq!(conv_output_size(32, 3, 1, PaddingType::Valid).unwrap(), (30, 0, 0));
        assert_eq!(conv_output_size(5, 3, 1, PaddingType::Full).unwrap(), (7, 2, 2));
        // 4 -> ceil(4/2) = 2, pad_total = 1*2 + 2 - 4 = 0
        assert_eq!(conv_output_size(4, 2, 2, PaddingType::Same).unwrap(), (2, 0, 0));
        // even kernel: smaller half first
        assert_eq!(conv_output_size(6, 4, 1, PaddingType::Same).unwrap(), (6, 1, 2));
    }

    #[test]
    fn test_output_size_rejects_bad_input() {
        assert!(conv_output_size(32, 3, 1, PaddingType::Unknown).is_err());
        assert!(conv_output_size(2, 3, 1, PaddingType::Valid).is_err());
        assert!(conv_output_size(8, 3, 0, PaddingType::Valid).is_err());
    }

    #[test]
    fn test_conv2d_initialization() {
        let conv = layer(&["input_shape=1:3:8:8", "filters=4", "kernel_size=3"]);
        assert_eq!(conv.filters().len(), 4);
        assert_eq!(conv.filters()[0].dim(), (1, 3, 3, 3));
        assert_eq!(conv.biases()[0].dim(), (1, 1, 1, 1));
        assert_eq!(conv.output_dim(), TensorDim::new(1, 4, 6, 6));
    }

    #[test]
    fn test_conv2d_parameter_count() {
        let conv = layer(&["input_shape=1:1:28:28", "filters=8", "kernel_size=3"]);
        // weights: 8 * 1 * 3 * 3 = 72, biases: 8
        assert_eq!(conv.parameter_count(), 80);
    }

    #[test]
    fn test_explicit_padding() {
        let conv = layer(&[
            "input_shape=1:1:4:4",
            "filters=1",
            "kernel_size=3",
            "padding=1,0,2,0",
        ]);
        assert_eq!(conv.pad(), [1, 0, 2, 0]);
        assert_eq!(conv.output_dim(), TensorDim::new(1, 1, 3, 4));
    }

    #[test]
    fn test_missing_filters_rejected() {
        let mut conv = Conv2DLayer::new();
        conv.set_property(&["input_shape=1:1:4:4", "kernel_size=3"]).unwrap();
        conv.set_optimizer(&Optimizer::sgd(0.1).unwrap()).unwrap();
        assert!(matches!(conv.initialize(false), Err(NnError::InvalidParameter(_))));
    }

    #[test]
    fn test_unknown_padding_fails_at_initialize() {
        let mut conv = Conv2DLayer::new();
        conv.set_property(&["input_shape=1:1:4:4", "filters=1", "kernel_size=3", "padding=mirror"])
            .unwrap();
        conv.set_optimizer(&Optimizer::sgd(0.1).unwrap()).unwrap();
        assert!(matches!(conv.initialize(false), Err(NnError::InvalidParameter(_))));
    }

    #[test]
    fn test_rejects_foreign_property() {
        let mut conv = Conv2DLayer::new();
        let result = conv.set_property(&["filters=2", "dilation=2", "kernel_size=3"]);
        assert!(matches!(result, Err(NnError::InvalidParameter(_))));
        assert_eq!(conv.filter_size(), 2);
        assert_eq!(conv.kernel_size(), [0, 0]);
    }

    #[test]
    fn test_adam_states_per_filter() {
        let mut conv = Conv2DLayer::new();
        conv.set_property(&["input_shape=1:2:5:5", "filters=3", "kernel_size=2"])
            .unwrap();
        let adam = Optimizer::adam(0.01, 0.9, 0.999, 1e-8).unwrap();
        assert_eq!(adam.kind(), OptType::Adam);
        conv.set_optimizer(&adam).unwrap();
        conv.initialize(false).unwrap();

        let states = conv.optimizer_states();
        assert_eq!(states.len(), 3);
        assert_eq!(states[0].wm().unwrap().dim(), (1, 2, 2, 2));
        assert_eq!(states[0].bm().unwrap().dim(), (1, 1, 1, 1));
    }

    #[test]
    fn test_backward_without_forward() {
        let mut conv = layer(&["input_shape=1:1:4:4", "filters=1", "kernel_size=3"]);
        let grad = Tensor::zeros((1, 1, 2, 2));
        assert!(matches!(conv.backward(&grad, 0), Err(NnError::InvalidState(_))));
    }

    #[test]
    fn test_inference_forward_does_not_cache() {
        let mut conv = layer(&["input_shape=1:1:4:4", "filters=1", "kernel_size=3"]);
        conv.set_training(false);
        let out = conv.forward(&Tensor::ones((1, 1, 4, 4))).unwrap();
        assert!(matches!(conv.backward(&out, 0), Err(NnError::InvalidState(_))));
    }
}
