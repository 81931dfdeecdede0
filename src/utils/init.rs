//! Weight initialization policies.

use std::str::FromStr;

use serde::Deserialize;

use crate::error::NnError;
use crate::tensor::Tensor;
use crate::utils::SimpleRng;

/// How trainable tensors are filled at `initialize` time.
///
/// `fan_in`/`fan_out` follow the convolution convention:
/// channels × kernel_h × kernel_w on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightInit {
    Zeros,
    LecunNormal,
    LecunUniform,
    XavierNormal,
    #[default]
    XavierUniform,
    HeNormal,
    HeUniform,
}

impl WeightInit {
    pub fn fill(&self, tensor: &mut Tensor, fan_in: usize, fan_out: usize, rng: &mut SimpleRng) {
        let fan_in = fan_in.max(1) as f32;
        let fan_out = fan_out.max(1) as f32;
        match self {
            WeightInit::Zeros => tensor.fill(0.0),
            WeightInit::LecunNormal => {
                let std = (1.0 / fan_in).sqrt();
                tensor.mapv_inplace(|_| rng.normal(0.0, std));
            }
            WeightInit::LecunUniform => {
                let limit = (3.0 / fan_in).sqrt();
                tensor.mapv_inplace(|_| rng.uniform(-limit, limit));
            }
            WeightInit::XavierNormal => {
                let std = (2.0 / (fan_in + fan_out)).sqrt();
                tensor.mapv_inplace(|_| rng.normal(0.0, std));
            }
            WeightInit::XavierUniform => {
                let limit = (6.0 / (fan_in + fan_out)).sqrt();
                tensor.mapv_inplace(|_| rng.uniform(-limit, limit));
            }
            WeightInit::HeNormal => {
                let std = (2.0 / fan_in).sqrt();
                tensor.mapv_inplace(|_| rng.normal(0.0, std));
            }
            WeightInit::HeUniform => {
                let limit = (6.0 / fan_in).sqrt();
                tensor.mapv_inplace(|_| rng.uniform(-limit, limit));
            }
        }
    }
}

impl FromStr for WeightInit {
    type Err = NnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zeros" => Ok(WeightInit::Zeros),
            "lecun_normal" => Ok(WeightInit::LecunNormal),
            "lecun_uniform" => Ok(WeightInit::LecunUniform),
            "xavier_normal" => Ok(WeightInit::XavierNormal),
            "xavier_uniform" => Ok(WeightInit::XavierUniform),
            "he_normal" => Ok(WeightInit::HeNormal),
            "he_uniform" => Ok(WeightInit::HeUniform),
            other => Err(NnError::invalid(format!("unknown weight initializer '{}'", other))),
        }
    }
}
