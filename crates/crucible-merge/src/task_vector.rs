//! Task-vector extraction.
//!
//! A task vector is the delta between a fine-tuned model's weight and the
//! base model's weight. Extraction consumes the supplied tensor map entry by
//! entry: weight tensors dominate peak memory, so each model's raw tensor is
//! released as soon as its delta has been computed. Callers hand over
//! ownership of the map and must treat it as consumed.

use ndarray::{ArrayD, Slice};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

use crucible_core::{ModelReference, Tensor, WeightInfo};

use crate::{MergeError, Result, TensorParams};

/// Materialized weight tensors for one merge call, keyed by model.
pub type TensorMap = HashMap<ModelReference, Tensor>;

/// One model's task vector plus its per-model parameters.
#[derive(Debug, Clone)]
pub struct TaskVector {
    /// The contributing model.
    pub model: ModelReference,
    /// Delta from the base tensor, in the base tensor's dtype.
    pub delta: ArrayD<f32>,
    /// Per-model tensor parameters.
    pub params: TensorParams,
}

/// A per-weight diagnostic emitted during extraction.
///
/// Diagnostics report contributions that were dropped or adjusted; they never
/// abort the merge. Callers decide how to surface them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The weight being merged.
    pub weight: String,
    /// The model the diagnostic concerns.
    pub model: ModelReference,
    /// What happened.
    pub reason: DiagnosticReason,
}

/// Why a diagnostic was emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticReason {
    /// The model's tensor shape did not match the base and its contribution
    /// was dropped.
    SizeMismatchSkipped {
        /// Base tensor shape.
        expected: Vec<usize>,
        /// Model tensor shape.
        actual: Vec<usize>,
    },
    /// An embedding tensor was truncated to the base shape.
    EmbedTruncated {
        /// Model tensor shape before truncation.
        from: Vec<usize>,
        /// Base tensor shape.
        to: Vec<usize>,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            DiagnosticReason::SizeMismatchSkipped { expected, actual } => write!(
                f,
                "skipping {}:{} due to size mismatch (base {:?}, model {:?})",
                self.model, self.weight, expected, actual
            ),
            DiagnosticReason::EmbedTruncated { from, to } => write!(
                f,
                "using {:?} submatrix of {}:{} ({:?})",
                to, self.model, self.weight, from
            ),
        }
    }
}

/// Extract task vectors for every non-base model in `tensors`.
///
/// Takes ownership of the tensor map and drains it: each model's tensor is
/// removed, cast to the base dtype, differenced against the base, and freed.
/// Models are processed in sorted reference order so results and diagnostics
/// are reproducible.
///
/// Shape mismatches follow the per-weight policy: embedding tensors are
/// truncated to the base's leading sub-block, other tensors are skipped.
/// Both cases produce a [`Diagnostic`] and a `tracing` warning.
///
/// Returns the task vectors, the base tensor, and any diagnostics. A model
/// present in the map but missing from `tensor_params` is a configuration
/// error (`weight` is required per model).
pub fn extract_task_vectors(
    weight: &WeightInfo,
    base_model: &ModelReference,
    mut tensors: TensorMap,
    tensor_params: &HashMap<ModelReference, TensorParams>,
) -> Result<(Vec<TaskVector>, Tensor, Vec<Diagnostic>)> {
    let base = tensors
        .remove(base_model)
        .ok_or_else(|| MergeError::TensorNotFound {
            model: base_model.clone(),
            weight: weight.name.clone(),
        })?;

    let mut models: Vec<ModelReference> = tensors.keys().cloned().collect();
    models.sort();

    let mut vectors = Vec::with_capacity(models.len());
    let mut diagnostics = Vec::new();

    for model in models {
        let Some(tensor) = tensors.remove(&model) else {
            continue;
        };
        let params = tensor_params.get(&model).copied().ok_or_else(|| {
            MergeError::InvalidConfig(format!("no tensor parameters for model {model}"))
        })?;

        let tensor = tensor.into_dtype(base.dtype());

        let data = if tensor.shape() == base.shape() {
            tensor.into_data()
        } else if weight.is_embed {
            let from = tensor.shape().to_vec();
            match leading_subblock(tensor.into_data(), base.shape()) {
                Some(truncated) => {
                    let diagnostic = Diagnostic {
                        weight: weight.name.clone(),
                        model: model.clone(),
                        reason: DiagnosticReason::EmbedTruncated {
                            from,
                            to: base.shape().to_vec(),
                        },
                    };
                    warn!("{diagnostic}");
                    diagnostics.push(diagnostic);
                    truncated
                }
                None => {
                    // Model embedding is smaller than the base on some axis;
                    // nothing sensible to truncate to.
                    skip(weight, &model, base.shape(), &from, &mut diagnostics);
                    continue;
                }
            }
        } else {
            let actual = tensor.shape().to_vec();
            skip(weight, &model, base.shape(), &actual, &mut diagnostics);
            continue;
        };

        let delta = data - base.data();
        vectors.push(TaskVector {
            model,
            delta,
            params,
        });
    }

    Ok((vectors, base, diagnostics))
}

fn skip(
    weight: &WeightInfo,
    model: &ModelReference,
    expected: &[usize],
    actual: &[usize],
    diagnostics: &mut Vec<Diagnostic>,
) {
    let diagnostic = Diagnostic {
        weight: weight.name.clone(),
        model: model.clone(),
        reason: DiagnosticReason::SizeMismatchSkipped {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        },
    };
    warn!("{diagnostic}");
    diagnostics.push(diagnostic);
}

/// Take the leading sub-block of `data` matching `target` on every axis.
///
/// Returns `None` when the ranks differ or any axis of `data` is shorter
/// than the target.
pub(crate) fn leading_subblock(data: ArrayD<f32>, target: &[usize]) -> Option<ArrayD<f32>> {
    if data.ndim() != target.len()
        || data.shape().iter().zip(target).any(|(have, want)| have < want)
    {
        return None;
    }
    let view = data.slice_each_axis(|ax| Slice::from(0..target[ax.axis.index()]));
    Some(view.to_owned())
}
