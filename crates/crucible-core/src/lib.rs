//! Core types for the Crucible model merging toolkit.
//!
//! This crate provides the foundational types shared across the Crucible
//! workspace:
//!
//! - [`Tensor`]: an n-dimensional weight tensor with an explicit storage dtype
//! - [`DType`]: the supported storage precisions (f32, f16, bf16)
//! - [`ModelReference`]: a hashable identifier for a source model
//! - [`WeightInfo`]: the identity of one named parameter tensor
//! - Error handling infrastructure

#![warn(missing_docs)]

mod error;
mod model;
mod tensor;

pub use error::*;
pub use model::*;
pub use tensor::*;
