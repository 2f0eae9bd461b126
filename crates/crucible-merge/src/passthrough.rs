//! Passthrough of a single model's weights, with optional scaling.

use crucible_core::Tensor;

use crate::task_vector::TensorMap;
use crate::{MergeError, Result};

/// Pass one model's tensor through unchanged, optionally scaled.
///
/// Exactly one tensor must be present; frankenmerging layers from a single
/// donor is the intended use. Scaling converts to f32 and back, so the output
/// keeps the input dtype.
pub fn passthrough_merge(tensors: TensorMap, scale: Option<f32>) -> Result<Tensor> {
    let count = tensors.len();
    let mut values = tensors.into_values();
    let tensor = match (values.next(), values.next()) {
        (Some(tensor), None) => tensor,
        _ => {
            return Err(MergeError::InvalidConfig(format!(
                "passthrough merge expects exactly one tensor, got {count}"
            )))
        }
    };

    match scale {
        Some(scale) if scale != 1.0 => {
            let dtype = tensor.dtype();
            let mut data = tensor.into_data();
            data.mapv_inplace(|v| v * scale);
            Ok(Tensor::from_array(data, dtype))
        }
        _ => Ok(tensor),
    }
}
