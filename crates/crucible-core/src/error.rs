//! Error types for core tensor operations.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by core tensor construction and manipulation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Tensor shapes do not match for an elementwise operation.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// The element count does not fit the requested shape.
    #[error("cannot build tensor of shape {shape:?} from {len} elements")]
    InvalidShape {
        /// Requested shape.
        shape: Vec<usize>,
        /// Number of elements provided.
        len: usize,
    },

    /// Unrecognized dtype name.
    #[error("unknown dtype: {0:?}")]
    UnknownDtype(String),
}
