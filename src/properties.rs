//! `key=value` property parsing
//!
//! Layers and the optimizer are configured with lists of `"key=value"`
//! strings. Each entry is parsed eagerly into a typed value; components then
//! accept or reject the parsed variant. Keys are case-insensitive.

use std::str::FromStr;

use tracing::error;

use crate::error::{NnError, Result};
use crate::optimizers::WeightDecayType;
use crate::tensor::TensorDim;
use crate::utils::{ActivationType, WeightInit};

/// Splits `"key = value"` into a lower-cased key and the trimmed value.
pub fn split_key_value(entry: &str) -> Result<(String, &str)> {
    let (key, value) = entry.split_once('=').ok_or_else(|| {
        error!(entry, "property is not in key=value form");
        NnError::invalid(format!("property '{}' is not in key=value form", entry))
    })?;
    let key = key.trim().to_ascii_lowercase();
    let value = value.trim();
    if key.is_empty() || value.is_empty() {
        error!(entry, "property has an empty key or value");
        return Err(NnError::invalid(format!("property '{}' has an empty side", entry)));
    }
    Ok((key, value))
}

pub(crate) fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        error!(key, value, "cannot parse property value");
        NnError::invalid(format!("cannot parse '{}' for property '{}'", value, key))
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(NnError::invalid(format!(
            "cannot parse '{}' as boolean for property '{}'",
            value, key
        ))),
    }
}

/// Parses `N` comma-separated unsigned integers. A single value is broadcast.
fn parse_array<const N: usize>(key: &str, value: &str) -> Result<[usize; N]> {
    let parts = value
        .split(',')
        .map(|p| parse_value::<usize>(key, p.trim()))
        .collect::<Result<Vec<_>>>()?;
    match parts.len() {
        1 => Ok([parts[0]; N]),
        n if n == N => {
            let mut out = [0usize; N];
            out.copy_from_slice(&parts);
            Ok(out)
        }
        n => Err(NnError::invalid(format!(
            "property '{}' expects 1 or {} values, got {}",
            key, N, n
        ))),
    }
}

/// Padding policy for convolution-style layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingType {
    Full,
    Same,
    Valid,
    /// Unrecognized keyword; rejected when the layer is initialized.
    Unknown,
}

impl From<&str> for PaddingType {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => PaddingType::Full,
            "same" => PaddingType::Same,
            "valid" => PaddingType::Valid,
            _ => PaddingType::Unknown,
        }
    }
}

/// Either a padding policy or explicit (top, bottom, left, right) amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding2D {
    Mode(PaddingType),
    Explicit([usize; 4]),
}

impl Default for Padding2D {
    fn default() -> Self {
        Padding2D::Mode(PaddingType::Valid)
    }
}

impl FromStr for Padding2D {
    type Err = NnError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().starts_with(|c: char| c.is_ascii_digit()) {
            parse_array::<4>("padding", s).map(Padding2D::Explicit)
        } else {
            Ok(Padding2D::Mode(PaddingType::from(s)))
        }
    }
}

/// A parsed layer property.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    InputShape(TensorDim),
    BiasInitZero(bool),
    Activation(ActivationType),
    WeightDecay(WeightDecayType),
    WeightDecayLambda(f32),
    WeightInit(WeightInit),
    Filters(usize),
    KernelSize([usize; 2]),
    Stride([usize; 2]),
    Padding(Padding2D),
    OutputPadding([usize; 4]),
    Dilation([usize; 2]),
}

impl Property {
    /// Key this property was parsed from, for error messages.
    pub fn key(&self) -> &'static str {
        match self {
            Property::InputShape(_) => "input_shape",
            Property::BiasInitZero(_) => "bias_init_zero",
            Property::Activation(_) => "activation",
            Property::WeightDecay(_) => "weight_decay",
            Property::WeightDecayLambda(_) => "weight_decay_lambda",
            Property::WeightInit(_) => "weight_ini",
            Property::Filters(_) => "filters",
            Property::KernelSize(_) => "kernel_size",
            Property::Stride(_) => "stride",
            Property::Padding(_) => "padding",
            Property::OutputPadding(_) => "output_padding",
            Property::Dilation(_) => "dilation",
        }
    }
}

impl FromStr for Property {
    type Err = NnError;

    fn from_str(entry: &str) -> Result<Self> {
        let (key, value) = split_key_value(entry)?;
        let key = key.as_str();
        let prop = match key {
            "input_shape" => Property::InputShape(value.parse()?),
            "bias_init_zero" => Property::BiasInitZero(parse_bool(key, value)?),
            "activation" => Property::Activation(value.parse()?),
            "weight_decay" => Property::WeightDecay(value.parse()?),
            "weight_decay_lambda" => Property::WeightDecayLambda(parse_value(key, value)?),
            "weight_ini" => Property::WeightInit(value.parse()?),
            "filters" | "filter" => Property::Filters(parse_value(key, value)?),
            "kernel_size" => Property::KernelSize(parse_array::<2>(key, value)?),
            "stride" => Property::Stride(parse_array::<2>(key, value)?),
            "padding" => Property::Padding(value.parse()?),
            "output_padding" => Property::OutputPadding(parse_array::<4>(key, value)?),
            "dilation" => Property::Dilation(parse_array::<2>(key, value)?),
            _ => {
                error!(key, "unknown layer property");
                return Err(NnError::invalid(format!("unknown layer property '{}'", key)));
            }
        };
        Ok(prop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_key_value_trims_and_lowercases() {
        let (k, v) = split_key_value("  Learning_Rate = 0.01 ").unwrap();
        assert_eq!(k, "learning_rate");
        assert_eq!(v, "0.01");
    }

    #[test]
    fn test_split_rejects_missing_equals() {
        assert!(split_key_value("learning_rate").is_err());
        assert!(split_key_value("=3").is_err());
        assert!(split_key_value("beta1=").is_err());
    }

    #[test]
    fn test_parse_kernel_size() {
        assert_eq!(
            "kernel_size=3,5".parse::<Property>().unwrap(),
            Property::KernelSize([3, 5])
        );
        assert_eq!(
            "kernel_size=3".parse::<Property>().unwrap(),
            Property::KernelSize([3, 3])
        );
        assert!("kernel_size=1,2,3".parse::<Property>().is_err());
    }

    #[test]
    fn test_parse_padding_forms() {
        assert_eq!(
            "padding=same".parse::<Property>().unwrap(),
            Property::Padding(Padding2D::Mode(PaddingType::Same))
        );
        assert_eq!(
            "padding=mirror".parse::<Property>().unwrap(),
            Property::Padding(Padding2D::Mode(PaddingType::Unknown))
        );
        assert_eq!(
            "padding=1,1,2,2".parse::<Property>().unwrap(),
            Property::Padding(Padding2D::Explicit([1, 1, 2, 2]))
        );
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(
            "bias_init_zero=true".parse::<Property>().unwrap(),
            Property::BiasInitZero(true)
        );
        assert!("bias_init_zero=maybe".parse::<Property>().is_err());
    }

    #[test]
    fn test_unknown_key() {
        assert!(matches!(
            "momentum=0.9".parse::<Property>(),
            Err(NnError::InvalidParameter(_))
        ));
    }
}
