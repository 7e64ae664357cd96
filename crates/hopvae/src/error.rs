//! Error types for HopVAE
//!
//! Every fallible operation in the crate returns [`Result`]. Tensor engine
//! failures are wrapped rather than flattened so callers can still match on
//! the underlying candle error.

use thiserror::Error;

/// Result type alias for HopVAE operations
pub type Result<T> = std::result::Result<T, HopVaeError>;

/// Main error type for HopVAE
#[derive(Error, Debug)]
pub enum HopVaeError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A derived dimension disagrees with the configured one
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which quantity was checked
        what: &'static str,
        /// Value required by the configuration
        expected: usize,
        /// Value actually observed
        actual: usize,
    },

    /// A tensor arrived with an unexpected shape
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected dimensions
        expected: Vec<usize>,
        /// Actual dimensions
        actual: Vec<usize>,
    },

    /// Tensor engine errors
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl HopVaeError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

impl From<serde_json::Error> for HopVaeError {
    fn from(err: serde_json::Error) -> Self {
        HopVaeError::Serialization(err.to_string())
    }
}
