//! On-device neural network training primitives
//!
//! Trainable layers with their own backward pass and parameter update, an
//! SGD/Adam optimizer, and a move-only device buffer.
//!
//! # Modules
//!
//! - `layers`: Layer trait and implementations (BatchNormalization, Conv2D, TransposedConv2d)
//! - `optimizers`: Optimizer policy, per-layer optimizer state, SGD and Adam rules
//! - `opencl`: Device buffer with host-memory and OpenCL backends
//! - `tensor`: Tensor type, shape descriptor and raw parameter I/O
//! - `properties`: `key=value` property parsing
//! - `config`: JSON model description and layer construction
//! - `utils`: Shared utilities (RNG, activation functions, weight initializers)
//! - `error`: Crate error type

pub mod config;
pub mod error;
pub mod layers;
pub mod opencl;
pub mod optimizers;
pub mod properties;
pub mod tensor;
pub mod utils;

pub use error::{NnError, Result};
pub use tensor::{Tensor, TensorDim};
