//! Configuration shared by every layer type.

use tracing::{debug, error};

use crate::error::{NnError, Result};
use crate::optimizers::{OptType, Optimizer, WeightDecay};
use crate::properties::Property;
use crate::tensor::TensorDim;
use crate::utils::{ActivationType, WeightInit};

/// Default seed for parameter initialization.
pub const DEFAULT_SEED: u64 = 42;

/// Common layer state: dimensions, flags and the attached optimizer policy.
///
/// Everything here is configured through the common property keys
/// (`input_shape`, `bias_init_zero`, `activation`, `weight_decay`,
/// `weight_decay_lambda`, `weight_ini`) or through the [`Layer`] trait.
///
/// [`Layer`]: crate::layers::Layer
#[derive(Debug, Clone)]
pub struct LayerBase {
    pub(crate) input_dim: TensorDim,
    pub(crate) output_dim: TensorDim,
    pub(crate) last: bool,
    pub(crate) bias_init_zero: bool,
    pub(crate) activation: ActivationType,
    pub(crate) weight_init: WeightInit,
    pub(crate) weight_decay: WeightDecay,
    pub(crate) optimizer: Optimizer,
    pub(crate) training: bool,
    pub(crate) initialized: bool,
    pub(crate) seed: u64,
}

impl Default for LayerBase {
    fn default() -> Self {
        Self {
            input_dim: TensorDim::default(),
            output_dim: TensorDim::default(),
            last: false,
            bias_init_zero: false,
            activation: ActivationType::None,
            weight_init: WeightInit::default(),
            weight_decay: WeightDecay::none(),
            optimizer: Optimizer::default(),
            training: true,
            initialized: false,
            seed: DEFAULT_SEED,
        }
    }
}

impl LayerBase {
    pub fn input_dim(&self) -> TensorDim {
        self.input_dim
    }

    pub fn output_dim(&self) -> TensorDim {
        self.output_dim
    }

    pub fn is_last(&self) -> bool {
        self.last
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn bias_init_zero(&self) -> bool {
        self.bias_init_zero
    }

    pub fn activation(&self) -> ActivationType {
        self.activation
    }

    pub fn weight_decay(&self) -> WeightDecay {
        self.weight_decay
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    /// Applies a common property. Returns `false` if `prop` is layer-specific.
    pub(crate) fn apply(&mut self, prop: &Property) -> bool {
        match *prop {
            Property::InputShape(dim) => self.input_dim = dim,
            Property::BiasInitZero(v) => self.bias_init_zero = v,
            Property::Activation(a) => self.activation = a,
            Property::WeightDecay(kind) => self.weight_decay.kind = kind,
            Property::WeightDecayLambda(lambda) => self.weight_decay.lambda = lambda,
            Property::WeightInit(init) => self.weight_init = init,
            _ => return false,
        }
        true
    }

    pub(crate) fn reject(&self, layer: &str, prop: &Property) -> NnError {
        error!(layer, key = prop.key(), "property not supported by layer");
        NnError::invalid(format!(
            "{} layer does not accept property '{}'",
            layer,
            prop.key()
        ))
    }

    /// Checks that initialization may proceed and records the last-layer flag.
    pub(crate) fn begin_initialize(&mut self, layer: &str, last: bool) -> Result<()> {
        if self.initialized {
            error!(layer, "layer is already initialized");
            return Err(NnError::state(format!("{} layer is already initialized", layer)));
        }
        if self.input_dim.is_degenerate() {
            error!(layer, input_dim = %self.input_dim, "input dimension must be greater than 0");
            return Err(NnError::invalid(format!(
                "{} layer has a degenerate input shape {}",
                layer, self.input_dim
            )));
        }
        if self.optimizer.kind() == OptType::Unknown {
            error!(layer, "no optimizer attached before initialize");
            return Err(NnError::invalid(format!(
                "{} layer needs an optimizer before initialize",
                layer
            )));
        }
        self.last = last;
        Ok(())
    }

    pub(crate) fn finish_initialize(&mut self, layer: &str, output_dim: TensorDim) {
        self.output_dim = output_dim;
        self.initialized = true;
        debug!(layer, input = %self.input_dim, output = %output_dim, last = self.last, "layer initialized");
    }

    pub(crate) fn require_initialized(&self, layer: &str) -> Result<()> {
        if !self.initialized {
            return Err(NnError::state(format!("{} layer is not initialized", layer)));
        }
        Ok(())
    }

    /// Checks that `found` matches the configured input shape, ignoring batch.
    pub(crate) fn check_input(&self, found: TensorDim) -> Result<()> {
        let expected = self.input_dim;
        if found.batch == 0
            || (found.channel, found.height, found.width)
                != (expected.channel, expected.height, expected.width)
        {
            return Err(NnError::shape(expected.shape(), found.shape()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizers::WeightDecayType;

    #[test]
    fn test_common_properties_apply() {
        let mut base = LayerBase::default();
        for entry in [
            "input_shape=4:3:8:8",
            "bias_init_zero=true",
            "activation=relu",
            "weight_decay=l2norm",
            "weight_decay_lambda=0.005",
            "weight_ini=he_normal",
        ] {
            let prop: Property = entry.parse().unwrap();
            assert!(base.apply(&prop), "{} not applied", entry);
        }

        assert_eq!(base.input_dim(), TensorDim::new(4, 3, 8, 8));
        assert!(base.bias_init_zero());
        assert_eq!(base.activation(), ActivationType::Relu);
        assert_eq!(base.weight_decay().kind, WeightDecayType::L2Norm);
        assert_eq!(base.weight_decay().lambda, 0.005);
        assert_eq!(base.weight_init, WeightInit::HeNormal);
    }

    #[test]
    fn test_layer_specific_property_not_applied() {
        let mut base = LayerBase::default();
        let prop: Property = "filters=8".parse().unwrap();
        assert!(!base.apply(&prop));
    }

    #[test]
    fn test_begin_initialize_rejects_degenerate_input() {
        let mut base = LayerBase::default();
        assert!(matches!(
            base.begin_initialize("test", false),
            Err(NnError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_begin_initialize_requires_optimizer() {
        let mut base = LayerBase {
            input_dim: TensorDim::new(1, 1, 2, 2),
            ..LayerBase::default()
        };
        assert!(matches!(
            base.begin_initialize("test", false),
            Err(NnError::InvalidParameter(_))
        ));
        assert!(!base.is_initialized());

        base.optimizer = Optimizer::sgd(0.1).unwrap();
        assert!(base.begin_initialize("test", false).is_ok());
    }

    #[test]
    fn test_initialize_only_once() {
        let mut base = LayerBase {
            input_dim: TensorDim::new(1, 1, 2, 2),
            optimizer: Optimizer::sgd(0.1).unwrap(),
            ..LayerBase::default()
        };
        base.begin_initialize("test", true).unwrap();
        base.finish_initialize("test", TensorDim::new(1, 1, 2, 2));
        assert!(base.is_last());
        assert!(matches!(
            base.begin_initialize("test", true),
            Err(NnError::InvalidState(_))
        ));
    }

    #[test]
    fn test_check_input_ignores_batch() {
        let base = LayerBase {
            input_dim: TensorDim::new(8, 3, 4, 4),
            ..LayerBase::default()
        };
        assert!(base.check_input(TensorDim::new(2, 3, 4, 4)).is_ok());
        assert!(base.check_input(TensorDim::new(2, 3, 4, 5)).is_err());
    }
}
