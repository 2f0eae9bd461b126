//! Weighted linear averaging of model weights.

use ndarray::ArrayD;
use std::collections::HashMap;
use tracing::warn;

use crucible_core::{ModelReference, Tensor, WeightInfo};

use crate::task_vector::{leading_subblock, Diagnostic, DiagnosticReason, TensorMap};
use crate::{MergeError, Result};

/// Options for [`linear_merge`].
#[derive(Debug, Clone, Copy)]
pub struct LinearOptions {
    /// Divide the weighted sum by the total weight.
    pub normalize: bool,
}

impl Default for LinearOptions {
    fn default() -> Self {
        Self { normalize: true }
    }
}

/// Merge one weight tensor as a weighted average across models.
///
/// Models are visited in sorted order so the result is reproducible. Embedding
/// tensors with extra rows or columns are truncated to the smallest common
/// shape before averaging; other shape mismatches fail the merge. The output
/// takes the first model's dtype.
pub fn linear_merge(
    weight: &WeightInfo,
    mut tensors: TensorMap,
    weights: &HashMap<ModelReference, f32>,
    options: LinearOptions,
) -> Result<(Tensor, Vec<Diagnostic>)> {
    if tensors.is_empty() {
        return Err(MergeError::NotEnoughModels {
            expected: 1,
            actual: 0,
        });
    }

    let mut models: Vec<ModelReference> = tensors.keys().cloned().collect();
    models.sort();

    let mut diagnostics = Vec::new();
    let target_shape: Vec<usize> = if weight.is_embed {
        let mut target: Vec<usize> = tensors[&models[0]].shape().to_vec();
        for model in &models[1..] {
            let shape = tensors[model].shape();
            if shape.len() != target.len() {
                return Err(crucible_core::CoreError::ShapeMismatch {
                    expected: target.clone(),
                    actual: shape.to_vec(),
                }
                .into());
            }
            for (t, &s) in target.iter_mut().zip(shape) {
                *t = (*t).min(s);
            }
        }
        target
    } else {
        tensors[&models[0]].shape().to_vec()
    };

    let mut accum: Option<ArrayD<f32>> = None;
    let mut dtype = None;
    let mut total_weight = 0.0f32;

    for model in &models {
        let tensor = match tensors.remove(model) {
            Some(t) => t,
            None => continue,
        };
        let w = weights.get(model).copied().unwrap_or(1.0);

        dtype.get_or_insert(tensor.dtype());
        let shape = tensor.shape().to_vec();
        let data = if shape == target_shape {
            tensor.into_data()
        } else if !weight.is_embed {
            return Err(crucible_core::CoreError::ShapeMismatch {
                expected: target_shape,
                actual: shape,
            }
            .into());
        } else {
            match leading_subblock(tensor.into_data(), &target_shape) {
                Some(block) => {
                    warn!(weight = %weight.name, model = %model, from = ?shape, to = ?target_shape, "truncating embedding tensor");
                    diagnostics.push(Diagnostic {
                        weight: weight.name.clone(),
                        model: model.clone(),
                        reason: DiagnosticReason::EmbedTruncated {
                            from: shape,
                            to: target_shape.clone(),
                        },
                    });
                    block
                }
                None => {
                    return Err(crucible_core::CoreError::ShapeMismatch {
                        expected: target_shape,
                        actual: shape,
                    }
                    .into())
                }
            }
        };

        total_weight += w;
        match &mut accum {
            Some(accum) => {
                accum.zip_mut_with(&data, |a, &d| *a += w * d);
            }
            None => {
                let mut data = data;
                data.mapv_inplace(|d| d * w);
                accum = Some(data);
            }
        }
    }

    // tensors was non-empty, so both are set by the loop.
    let (Some(mut merged), Some(dtype)) = (accum, dtype) else {
        return Err(MergeError::NotEnoughModels {
            expected: 1,
            actual: 0,
        });
    };

    if options.normalize {
        let divisor = if total_weight.abs() < 1e-8 {
            1.0
        } else {
            total_weight
        };
        merged.mapv_inplace(|v| v / divisor);
    }
    Ok((Tensor::from_array(merged, dtype), diagnostics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::DType;

    fn tensor(values: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_slice(values, shape).unwrap()
    }

    #[test]
    fn test_weighted_average() {
        let a = ModelReference::new("a");
        let b = ModelReference::new("b");
        let tensors = TensorMap::from([
            (a.clone(), tensor(&[1.0, 2.0], &[2])),
            (b.clone(), tensor(&[3.0, 6.0], &[2])),
        ]);
        let weights = HashMap::from([(a, 1.0), (b, 3.0)]);

        let (merged, diags) = linear_merge(
            &WeightInfo::new("w"),
            tensors,
            &weights,
            LinearOptions::default(),
        )
        .unwrap();
        assert_eq!(merged.data().as_slice().unwrap(), &[2.5, 5.0]);
        assert!(diags.is_empty());
    }

    #[test]
    fn test_unnormalized_sum() {
        let a = ModelReference::new("a");
        let b = ModelReference::new("b");
        let tensors = TensorMap::from([
            (a.clone(), tensor(&[1.0], &[1])),
            (b.clone(), tensor(&[2.0], &[1])),
        ]);
        let weights = HashMap::from([(a, 1.0), (b, 1.0)]);

        let (merged, _) = linear_merge(
            &WeightInfo::new("w"),
            tensors,
            &weights,
            LinearOptions { normalize: false },
        )
        .unwrap();
        assert_eq!(merged.data().as_slice().unwrap(), &[3.0]);
    }

    #[test]
    fn test_zero_total_weight_is_finite() {
        let a = ModelReference::new("a");
        let tensors = TensorMap::from([(a.clone(), tensor(&[4.0, -2.0], &[2]))]);
        let weights = HashMap::from([(a, 0.0)]);

        let (merged, _) = linear_merge(
            &WeightInfo::new("w"),
            tensors,
            &weights,
            LinearOptions::default(),
        )
        .unwrap();
        assert!(merged.data().iter().all(|v| v.is_finite()));
        assert_eq!(merged.data().as_slice().unwrap(), &[0.0, 0.0]);
    }

    #[test]
    fn test_embed_truncates_to_common_shape() {
        let a = ModelReference::new("a");
        let b = ModelReference::new("b");
        // a is 3x2, b is 2x2; common shape is 2x2.
        let tensors = TensorMap::from([
            (a.clone(), tensor(&[1.0, 2.0, 3.0, 4.0, 9.0, 9.0], &[3, 2])),
            (b.clone(), tensor(&[3.0, 4.0, 5.0, 6.0], &[2, 2])),
        ]);
        let weights = HashMap::from([(a, 1.0), (b, 1.0)]);

        let (merged, diags) = linear_merge(
            &WeightInfo::embed("model.embed_tokens.weight"),
            tensors,
            &weights,
            LinearOptions::default(),
        )
        .unwrap();
        assert_eq!(merged.shape(), &[2, 2]);
        assert_eq!(merged.data().as_slice().unwrap(), &[2.0, 3.0, 4.0, 5.0]);
        assert_eq!(diags.len(), 1);
    }

    #[test]
    fn test_non_embed_mismatch_fails() {
        let a = ModelReference::new("a");
        let b = ModelReference::new("b");
        let tensors = TensorMap::from([
            (a.clone(), tensor(&[1.0, 2.0], &[2])),
            (b.clone(), tensor(&[1.0, 2.0, 3.0], &[3])),
        ]);
        let weights = HashMap::from([(a, 1.0), (b, 1.0)]);

        let err = linear_merge(
            &WeightInfo::new("w"),
            tensors,
            &weights,
            LinearOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::Core(_)));
    }

    #[test]
    fn test_empty_input_fails() {
        let err = linear_merge(
            &WeightInfo::new("w"),
            TensorMap::new(),
            &HashMap::new(),
            LinearOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::NotEnoughModels { .. }));
    }

    #[test]
    fn test_output_takes_first_model_dtype() {
        let a = ModelReference::new("a");
        let b = ModelReference::new("b");
        let tensors = TensorMap::from([
            (
                a.clone(),
                tensor(&[1.0, 2.0], &[2]).into_dtype(DType::Bf16),
            ),
            (b.clone(), tensor(&[3.0, 4.0], &[2])),
        ]);
        let weights = HashMap::from([(a, 1.0), (b, 1.0)]);

        let (merged, _) = linear_merge(
            &WeightInfo::new("w"),
            tensors,
            &weights,
            LinearOptions::default(),
        )
        .unwrap();
        assert_eq!(merged.dtype(), DType::Bf16);
    }
}
