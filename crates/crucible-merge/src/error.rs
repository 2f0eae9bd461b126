//! Error types for model merging operations.

use crucible_core::{CoreError, ModelReference};
use thiserror::Error;

/// Errors that can occur during model merging.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A required tensor was not present in the supplied tensor map.
    #[error("tensor not found for model {model}: {weight}")]
    TensorNotFound {
        /// The model whose tensor is missing.
        model: ModelReference,
        /// The weight being merged.
        weight: String,
    },

    /// A method name did not resolve to a known method.
    ///
    /// This is a configuration bug upstream and aborts the call; it is never
    /// silently defaulted.
    #[error("unsupported {kind} method {name:?}")]
    UnsupportedMethod {
        /// Which family of methods was being resolved.
        kind: &'static str,
        /// The unrecognized name.
        name: String,
    },

    /// Invalid merge configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Not enough models for the operation.
    #[error("expected at least {expected} models, got {actual}")]
    NotEnoughModels {
        /// Expected number of models.
        expected: usize,
        /// Actual number of models.
        actual: usize,
    },

    /// Core tensor error.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
