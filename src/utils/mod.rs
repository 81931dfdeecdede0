//! Shared utilities for layer implementations
//!
//! Deterministic random numbers, activation functions and weight
//! initialization policies.

pub mod activations;
pub mod init;
pub mod rng;

pub use activations::ActivationType;
pub use init::WeightInit;
pub use rng::SimpleRng;
