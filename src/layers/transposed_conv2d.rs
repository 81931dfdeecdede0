//! 2D transposed convolution (upsampling) layer
//!
//! The forward pass is the input-gradient operation of an ordinary
//! convolution: every input pixel scatters a scaled copy of each filter onto
//! a strided output grid. `padding` crops the full result and
//! `output_padding` extends it again on the output side.

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

const NAME: &str = "transposed_conv2d";

/// Output extent along one axis of a transposed convolution.
///
/// `(input - 1) * stride + dilation * (kernel - 1) + 1 - pad_before - pad_after
/// + out_pad_before + out_pad_after`
///
/// # Errors
///
/// [`NnError::InvalidParameter`] if the crop leaves nothing.
pub fn transposed_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad: [usize; 2],
    output_pad: [usize; 2],
) -> Result<usize> {
    if input == 0 || kernel == 0 || stride == 0 || dilation == 0 {
        return Err(NnError::invalid(
            "input, kernel, stride and dilation must be greater than 0",
        ));
    }
    let full = ((input - 1) * stride + dilation * (kernel - 1) + 1) as isize;
    let size = full - (pad[0] + pad[1]) as isize + (output_pad[0] + output_pad[1]) as isize;
    if size <= 0 {
        error!(input, kernel, stride, dilation, "padding crops the whole output");
        return Err(NnError::invalid(format!(
            "padding {:?} crops the whole transposed output of size {}",
            pad, full
        )));
    }
    Ok(size as usize)
}

/// Crop `(before, after)` along one axis for a padding keyword.
///
/// `valid` crops nothing. `same` crops `dilation * (kernel - 1) + 1 - stride`,
/// smaller half first, so the output is `input * stride`. `full` crops
/// `dilation * (kernel - 1)` from each side, undoing the zero padding a
/// full convolution adds.
///
/// # Errors
///
/// [`NnError::InvalidParameter`] for an unrecognized keyword.
pub fn transposed_crop(
    mode: PaddingType,
    kernel: usize,
    stride: usize,
    dilation: usize,
) -> Result<[usize; 2]> {
    let reach = dilation * kernel.saturating_sub(1);
    match mode {
        PaddingType::Valid => Ok([0, 0]),
        PaddingType::Same => {
            let total = (reach + 1).saturating_sub(stride);
            Ok([total / 2, total - total / 2])
        }
        PaddingType::Full => Ok([reach, reach]),
        PaddingType::Unknown => {
            error!(?mode, "unknown padding keyword for transposed convolution");
            Err(NnError::invalid("transposed_conv2d padding must be valid, same, full or t,b,l,r"))
        }
    }
}

struct TransposedCache {
    input: Tensor,
    output: Tensor,
}

/// Transposed 2D convolution with `filters` output channels.
///
/// Filters are stored as `(1, in_channels, kh, kw)`, one per output channel,
/// each with a `(1, 1, 1, 1)` bias.
///
/// Accepted properties: `filters`, `kernel_size`, `stride`, `dilation`,
/// `padding` (`valid`, `same`, `full` or explicit `t,b,l,r`),
/// `output_padding` (`t,b,l,r`),
/// plus the common layer keys.
pub struct TransposedConv2dLayer {
    base: LayerBase,
    filter_size: usize,
    kernel_size: [usize; 2],
    stride: [usize; 2],
    dilation: [usize; 2],
    padding: Padding2D,
    output_padding: [usize; 4],
    /// Resolved (top, bottom, left, right) crop.
    pad: [usize; 4],
    filters: Vec<Tensor>,
    biases: Vec<Tensor>,
    opt_states: Vec<OptimizerState>,
    cache: Option<TransposedCache>,
}

impl Default for TransposedConv2dLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl TransposedConv2dLayer {
    pub fn new() -> Self {
        Self {
            base: LayerBase::default(),
            filter_size: 0,
            kernel_size: [0, 0],
            stride: [1, 1],
            dilation: [1, 1],
            padding: Padding2D::default(),
            output_padding: [0; 4],
            pad: [0; 4],
            filters: Vec::new(),
            biases: Vec::new(),
            opt_states: Vec::new(),
            cache: None,
        }
    }

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

    pub fn dilation(&self) -> [usize; 2] {
        self.dilation
    }

    pub fn output_padding(&self) -> [usize; 4] {
        self.output_padding
    }

    /// Resolved (top, bottom, left, right) crop.
    pub fn pad(&self) -> [usize; 4] {
        self.pad
    }

    pub fn filters(&self) -> &[Tensor] {
        &self.filters
    }

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

    /// Copies configuration and parameters from `other` with fresh optimizer
    /// state and no forward cache.
    pub fn copy_from(&mut self, other: &TransposedConv2dLayer) {
        self.base = other.base.clone();
        self.filter_size = other.filter_size;
        self.kernel_size = other.kernel_size;
        self.stride = other.stride;
        self.dilation = other.dilation;
        self.padding = other.padding;
        self.output_padding = other.output_padding;
        self.pad = other.pad;
        self.filters = other.filters.clone();
        self.biases = other.biases.clone();
        self.opt_states = self.fresh_states().unwrap_or_default();
        self.cache = None;
    }

    // Small grid is the input, large grid is the output.
    fn geometry(&self) -> Geometry {
        Geometry {
            stride: self.stride,
            dilation: self.dilation,
            pad: [
                self.pad[0] as isize - self.output_padding[0] as isize,
                self.pad[2] as isize - self.output_padding[2] as isize,
            ],
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

    fn resolve_padding(&self) -> Result<[usize; 4]> {
        match self.padding {
            Padding2D::Explicit(pad) => Ok(pad),
            Padding2D::Mode(mode) => {
                let [top, bottom] =
                    transposed_crop(mode, self.kernel_size[0], self.stride[0], self.dilation[0])?;
                let [left, right] =
                    transposed_crop(mode, self.kernel_size[1], self.stride[1], self.dilation[1])?;
                Ok([top, bottom, left, right])
            }
        }
    }
}

impl Layer for TransposedConv2dLayer {
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
        if self.filter_size == 0
            || self.kernel_size.contains(&0)
            || self.stride.contains(&0)
            || self.dilation.contains(&0)
        {
            error!(
                filters = self.filter_size,
                kernel = ?self.kernel_size,
                stride = ?self.stride,
                dilation = ?self.dilation,
                "filters, kernel_size, stride and dilation must be greater than 0"
            );
            return Err(NnError::invalid(
                "transposed_conv2d needs filters, kernel_size, stride and dilation > 0",
            ));
        }

        let pad = self.resolve_padding()?;
        let input = self.base.input_dim;
        let oh = transposed_output_size(
            input.height,
            self.kernel_size[0],
            self.stride[0],
            self.dilation[0],
            [pad[0], pad[1]],
            [self.output_padding[0], self.output_padding[1]],
        )?;
        let ow = transposed_output_size(
            input.width,
            self.kernel_size[1],
            self.stride[1],
            self.dilation[1],
            [pad[2], pad[3]],
            [self.output_padding[2], self.output_padding[3]],
        )?;
        self.pad = pad;

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
        let stacked = self.stacked_filters()?;
        let weights = stacked.view().permuted_axes([1, 0, 2, 3]);
        let mut output = correlate_transpose(
            input,
            weights,
            (out_dim.height, out_dim.width),
            self.geometry(),
        );
        for (f, bias) in self.biases.iter().enumerate() {
            let b = bias[[0, 0, 0, 0]];
            output.slice_mut(s![.., f, .., ..]).mapv_inplace(|v| v + b);
        }
        self.base.activation.apply_inplace(&mut output);

        self.cache = if self.base.training {
            Some(TransposedCache {
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
            NnError::state("transposed_conv2d backward requires a preceding training-mode forward")
        })?;
        if derivative.dim() != cache.output.dim() {
            return Err(NnError::shape(cache.output.dim(), derivative.dim()));
        }

        let mut delta = derivative.clone();
        self.base.activation.backprop_inplace(&mut delta, &cache.output);

        let geom = self.geometry();
        let (_, _, in_h, in_w) = cache.input.dim();
        let stacked = self.stacked_filters()?;
        let weights = stacked.view().permuted_axes([1, 0, 2, 3]);
        let grad_input = correlate(&delta, weights, (in_h, in_w), geom);
        // (batch, in_channels, filters, kh, kw)
        let grad_filters = filter_gradient(&delta, &cache.input, self.kernel_size, geom);

        let summed = grad_filters.sum_axis(Axis(0));
        for f in 0..self.filter_size {
            let grad_w = summed.index_axis(Axis(1), f).to_owned().insert_axis(Axis(0));
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
                Property::Dilation(d) => self.dilation = d,
                Property::Padding(p) => self.padding = p,
                Property::OutputPadding(p) => self.output_padding = p,
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
        let mut layer = TransposedConv2dLayer::new();
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
