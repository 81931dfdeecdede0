//! Error type shared by every component of the crate.
//!
//! Configuration problems are reported eagerly as [`NnError::InvalidParameter`];
//! calling an operation out of order (backward without forward, a second
//! initialize) is reported as [`NnError::InvalidState`].

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NnError>;

#[derive(Debug, Error)]
pub enum NnError {
    /// Malformed or out-of-range configuration.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: String, found: String },

    /// An operation was called in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Allocation or transfer failure reported by the compute device.
    #[error("device error: {0}")]
    Device(String),
}

impl NnError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        NnError::InvalidParameter(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        NnError::InvalidState(msg.into())
    }

    pub(crate) fn shape(expected: impl std::fmt::Debug, found: impl std::fmt::Debug) -> Self {
        NnError::ShapeMismatch {
            expected: format!("{:?}", expected),
            found: format!("{:?}", found),
        }
    }
}
