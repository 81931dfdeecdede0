//! Model configuration
//!
//! A model is described in JSON as an optimizer plus an ordered list of
//! layers, each configured with the same `"key=value"` strings that
//! [`Layer::set_property`] accepts.
//!
//! # Example
//!
//! ```json
//! {
//!   "optimizer": { "type": "adam", "learning_rate": 0.001,
//!                  "beta1": 0.9, "beta2": 0.999, "epsilon": 1e-7 },
//!   "layers": [
//!     { "layer_type": "conv2d",
//!       "properties": ["input_shape=8:1:28:28", "filters=4", "kernel_size=3", "padding=same"] },
//!     { "layer_type": "batch_normalization", "properties": [] },
//!     { "layer_type": "transposed_conv2d",
//!       "properties": ["filters=1", "kernel_size=3", "padding=1,1,1,1"] }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, error};

use crate::error::{NnError, Result};
use crate::layers::{BatchNormalizationLayer, Conv2DLayer, Layer, TransposedConv2dLayer};
use crate::optimizers::{OptParam, OptType, Optimizer};

/// Optimizer section of a model file.
///
/// Hyperparameters sit next to `type`; missing ones take the
/// [`OptParam`] defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerConfig {
    #[serde(rename = "type")]
    pub kind: OptType,
    #[serde(flatten)]
    pub param: OptParam,
}

impl OptimizerConfig {
    /// Validated optimizer policy.
    pub fn build(&self) -> Result<Optimizer> {
        let mut optimizer = Optimizer::default();
        optimizer.set_type(self.kind)?;
        optimizer.set_param(self.param)?;
        Ok(optimizer)
    }
}

/// One layer of a model file.
#[derive(Debug, Clone, Deserialize)]
pub struct LayerConfig {
    /// `conv2d`, `transposed_conv2d` or `batch_normalization`
    pub layer_type: String,
    #[serde(default)]
    pub properties: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub optimizer: OptimizerConfig,
    pub layers: Vec<LayerConfig>,
    /// Weight initializer seed applied to every layer.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Loads a model description from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use ondevice_trainer::config::{build_layers, load_config};
///
/// let config = load_config("config/conv_autoencoder.json").unwrap();
/// let layers = build_layers(&config).unwrap();
/// assert_eq!(layers.len(), config.layers.len());
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ModelConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let config: ModelConfig = serde_json::from_str(&contents).map_err(|e| {
        error!(path = %path.display(), error = %e, "cannot parse model config");
        NnError::invalid(format!("invalid model config {}: {}", path.display(), e))
    })?;
    if config.layers.is_empty() {
        return Err(NnError::invalid("model config has no layers"));
    }
    Ok(config)
}

/// Creates an unconfigured layer from its type name.
pub fn create_layer(layer_type: &str) -> Result<Box<dyn Layer>> {
    match layer_type.trim().to_ascii_lowercase().as_str() {
        "conv2d" => Ok(Box::new(Conv2DLayer::new())),
        "transposed_conv2d" | "transposedconv2d" => Ok(Box::new(TransposedConv2dLayer::new())),
        "batch_normalization" | "batchnorm" | "bn" => Ok(Box::new(BatchNormalizationLayer::new())),
        other => {
            error!(layer_type = other, "unknown layer type");
            Err(NnError::invalid(format!("unknown layer type '{}'", other)))
        }
    }
}

/// Builds and initializes every layer of `config`.
///
/// Each layer after the first takes its input shape from the previous
/// layer's output; the first one needs an `input_shape` property. The last
/// layer is initialized with `last = true`.
pub fn build_layers(config: &ModelConfig) -> Result<Vec<Box<dyn Layer>>> {
    if config.layers.is_empty() {
        return Err(NnError::invalid("model config has no layers"));
    }
    let optimizer = config.optimizer.build()?;
    let count = config.layers.len();

    let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(count);
    for (i, layer_config) in config.layers.iter().enumerate() {
        let mut layer = create_layer(&layer_config.layer_type)?;
        let properties: Vec<&str> = layer_config.properties.iter().map(String::as_str).collect();
        layer.set_property(&properties).map_err(|e| {
            error!(index = i, layer = layer.name(), error = %e, "invalid layer property");
            e
        })?;
        if let Some(previous) = layers.last() {
            layer.set_input_dim(previous.output_dim());
        }
        if let Some(seed) = config.seed {
            layer.base_mut().seed = seed.wrapping_add(i as u64);
        }
        layer.set_optimizer(&optimizer)?;
        layer.initialize(i + 1 == count)?;
        debug!(index = i, layer = layer.name(), output = %layer.output_dim(), "layer built");
        layers.push(layer);
    }
    Ok(layers)
}
