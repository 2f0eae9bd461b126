//! Per-tensor model merging for Crucible
//!
//! This crate implements the generalized task-arithmetic family of merge
//! methods inspired by MergeKit, plus weighted linear averaging and
//! passthrough. A merge operates on one weight tensor at a time: callers load
//! the tensor for each model, call the method, and write the result out.
//!
//! # Supported Merge Methods
//!
//! - **Task Arithmetic**: weighted sum of task vectors over a base model
//! - **TIES**: magnitude pruning with sign consensus
//! - **DARE**: random pruning with rescaling, with or without consensus
//! - **Model Breadcrumbs**: dual-sided magnitude pruning
//! - **DELLA**: rank-magnitude sampling
//! - **Consensus TA / TIES**: tall-mask trimming of the aggregated delta
//! - **Linear**: weighted averaging without a base model
//! - **Passthrough**: a single model's tensor, optionally scaled
//!
//! # Example
//!
//! ```ignore
//! use crucible_merge::{GtaMerge, TensorParams};
//!
//! let merge = GtaMerge::ties();
//! let output = merge.merge_tensor(&weight, &base_model, tensors, &params)?;
//! ```

#![warn(missing_docs)]

mod config;
mod consensus;
mod error;
mod gta;
mod linear;
mod passthrough;
mod sparsify;
mod task_vector;

pub use config::*;
pub use consensus::*;
pub use error::*;
pub use gta::*;
pub use linear::*;
pub use passthrough::*;
pub use sparsify::*;
pub use task_vector::*;
