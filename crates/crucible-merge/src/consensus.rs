//! Sign consensus for task-vector aggregation.
//!
//! Sign consensus is the "elect sign" step of TIES-Merging (Yadav et al.,
//! NeurIPS 2023): per element, a majority sign is elected across the weighted
//! task vectors, and contributions whose sign opposes the majority are
//! discarded.
//!
//! Zero entries have sign 0 and never match the elected majority, so a
//! pruned-out element contributes neither to the mix nor to the divisor.

use ndarray::{ArrayD, Zip};

use crate::{ConsensusMethod, MergeError, Result};

/// Per-model boolean agreement masks over a stack of weighted deltas.
///
/// The masks select, per element, which models' contributions agree with the
/// elected majority sign. Storage is either f32 (directly multipliable) or
/// one byte per element when built with `int8_mask`; the choice has no
/// numeric effect.
#[derive(Debug, Clone)]
pub struct ConsensusMask {
    repr: MaskRepr,
}

#[derive(Debug, Clone)]
enum MaskRepr {
    F32(Vec<ArrayD<f32>>),
    I8(Vec<ArrayD<i8>>),
}

/// Build the sign-consensus mask for a stack of weighted deltas.
///
/// The majority sign per element is elected by the configured rule:
///
/// - [`ConsensusMethod::Sum`]: sign of the elementwise sum of the weighted
///   deltas (the TIES rule; magnitudes vote).
/// - [`ConsensusMethod::Count`]: sign of the count of positive minus
///   negative entries (one model, one vote).
///
/// Ties elect the positive sign (`>= 0`).
pub fn get_mask(
    weighted_deltas: &[ArrayD<f32>],
    method: ConsensusMethod,
    int8_mask: bool,
) -> Result<ConsensusMask> {
    let first = weighted_deltas
        .first()
        .ok_or(MergeError::NotEnoughModels {
            expected: 1,
            actual: 0,
        })?;

    let mut vote = ArrayD::<f32>::zeros(first.raw_dim());
    for delta in weighted_deltas {
        if delta.shape() != first.shape() {
            return Err(crucible_core::CoreError::ShapeMismatch {
                expected: first.shape().to_vec(),
                actual: delta.shape().to_vec(),
            }
            .into());
        }
        match method {
            ConsensusMethod::Sum => {
                Zip::from(&mut vote).and(delta).for_each(|v, &d| *v += d);
            }
            ConsensusMethod::Count => {
                Zip::from(&mut vote).and(delta).for_each(|v, &d| *v += sign(d));
            }
        }
    }
    let majority = vote.mapv(|v| if v >= 0.0 { 1.0 } else { -1.0 });

    let repr = if int8_mask {
        let masks = weighted_deltas
            .iter()
            .map(|delta| {
                let mut mask = ArrayD::<i8>::zeros(delta.raw_dim());
                Zip::from(&mut mask)
                    .and(delta)
                    .and(&majority)
                    .for_each(|m, &d, &maj| *m = i8::from(sign(d) == maj));
                mask
            })
            .collect();
        MaskRepr::I8(masks)
    } else {
        let masks = weighted_deltas
            .iter()
            .map(|delta| {
                let mut mask = ArrayD::<f32>::zeros(delta.raw_dim());
                Zip::from(&mut mask)
                    .and(delta)
                    .and(&majority)
                    .for_each(|m, &d, &maj| *m = f32::from(sign(d) == maj));
                mask
            })
            .collect();
        MaskRepr::F32(masks)
    };

    Ok(ConsensusMask { repr })
}

impl ConsensusMask {
    /// Number of per-model masks.
    pub fn len(&self) -> usize {
        match &self.repr {
            MaskRepr::F32(masks) => masks.len(),
            MaskRepr::I8(masks) => masks.len(),
        }
    }

    /// Whether the mask stack is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero the entries of `values` that model `index` lost in the vote.
    pub fn apply_inplace(&self, index: usize, values: &mut ArrayD<f32>) {
        match &self.repr {
            MaskRepr::F32(masks) => {
                Zip::from(values).and(&masks[index]).for_each(|v, &m| *v *= m);
            }
            MaskRepr::I8(masks) => {
                Zip::from(values).and(&masks[index]).for_each(|v, &m| {
                    if m == 0 {
                        *v = 0.0;
                    }
                });
            }
        }
    }

    /// Elementwise sum of effective weights: `sum_i weights[i] * mask[i]`.
    pub fn weighted_divisor(&self, weights: &[f32]) -> ArrayD<f32> {
        match &self.repr {
            MaskRepr::F32(masks) => {
                let mut divisor = ArrayD::<f32>::zeros(masks[0].raw_dim());
                for (mask, &w) in masks.iter().zip(weights) {
                    Zip::from(&mut divisor).and(mask).for_each(|d, &m| *d += w * m);
                }
                divisor
            }
            MaskRepr::I8(masks) => {
                let mut divisor = ArrayD::<f32>::zeros(masks[0].raw_dim());
                for (mask, &w) in masks.iter().zip(weights) {
                    Zip::from(&mut divisor).and(mask).for_each(|d, &m| {
                        if m != 0 {
                            *d += w;
                        }
                    });
                }
                divisor
            }
        }
    }

    /// The mask for model `index` as f32 (1.0 agree, 0.0 disagree).
    pub fn model_mask(&self, index: usize) -> ArrayD<f32> {
        match &self.repr {
            MaskRepr::F32(masks) => masks[index].clone(),
            MaskRepr::I8(masks) => masks[index].mapv(f32::from),
        }
    }
}

/// Sign with a true zero: +1, -1, or 0. `f32::signum` maps 0.0 to +1.0,
/// which would let pruned-out entries win votes.
fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn arr(values: &[f32]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()
    }

    #[test]
    fn test_all_agree() {
        let a = arr(&[1.0, -1.0, 1.0]);
        let b = arr(&[2.0, -2.0, 3.0]);

        let mask = get_mask(&[a, b], ConsensusMethod::Sum, false).unwrap();
        for i in 0..2 {
            let m = mask.model_mask(i);
            assert!(m.iter().all(|&v| v == 1.0));
        }
    }

    #[test]
    fn test_sum_rule_magnitudes_vote() {
        // Position 0: +1 vs -3 -> sum is negative, majority is negative.
        let a = arr(&[1.0]);
        let b = arr(&[-3.0]);

        let mask = get_mask(&[a, b], ConsensusMethod::Sum, false).unwrap();
        assert_eq!(mask.model_mask(0)[[0]], 0.0);
        assert_eq!(mask.model_mask(1)[[0]], 1.0);
    }

    #[test]
    fn test_count_rule_one_model_one_vote() {
        // Two positive models outvote one large negative model.
        let a = arr(&[1.0]);
        let b = arr(&[2.0]);
        let c = arr(&[-100.0]);

        let mask = get_mask(&[a, b, c], ConsensusMethod::Count, false).unwrap();
        assert_eq!(mask.model_mask(0)[[0]], 1.0);
        assert_eq!(mask.model_mask(1)[[0]], 1.0);
        assert_eq!(mask.model_mask(2)[[0]], 0.0);
    }

    #[test]
    fn test_tie_elects_positive() {
        let a = arr(&[1.0]);
        let b = arr(&[-1.0]);

        for method in [ConsensusMethod::Sum, ConsensusMethod::Count] {
            let mask = get_mask(&[a.clone(), b.clone()], method, false).unwrap();
            assert_eq!(mask.model_mask(0)[[0]], 1.0);
            assert_eq!(mask.model_mask(1)[[0]], 0.0);
        }
    }

    #[test]
    fn test_zero_entries_never_agree() {
        // A zeroed (pruned) entry has sign 0 and is excluded even though the
        // majority is positive.
        let a = arr(&[0.0]);
        let b = arr(&[2.0]);

        let mask = get_mask(&[a, b], ConsensusMethod::Sum, false).unwrap();
        assert_eq!(mask.model_mask(0)[[0]], 0.0);
        assert_eq!(mask.model_mask(1)[[0]], 1.0);
    }

    #[test]
    fn test_int8_storage_is_equivalent() {
        let a = arr(&[1.0, -2.0, 0.0, 3.0]);
        let b = arr(&[-1.0, -1.0, 2.0, 3.0]);
        let weights = [0.7, 1.3];

        let dense = get_mask(&[a.clone(), b.clone()], ConsensusMethod::Sum, false).unwrap();
        let compact = get_mask(&[a.clone(), b.clone()], ConsensusMethod::Sum, true).unwrap();

        for i in 0..2 {
            assert_eq!(dense.model_mask(i), compact.model_mask(i));

            let mut dv = a.clone();
            let mut cv = a.clone();
            dense.apply_inplace(i, &mut dv);
            compact.apply_inplace(i, &mut cv);
            assert_eq!(dv, cv);
        }
        assert_eq!(dense.weighted_divisor(&weights), compact.weighted_divisor(&weights));
    }

    #[test]
    fn test_weighted_divisor() {
        let a = arr(&[1.0, -1.0]);
        let b = arr(&[1.0, 1.0]);

        let mask = get_mask(&[a, b], ConsensusMethod::Sum, false).unwrap();
        let divisor = mask.weighted_divisor(&[0.5, 2.0]);
        // Position 0: both agree -> 2.5. Position 1: tie elects positive, so
        // only b agrees -> 2.0.
        assert_eq!(divisor[[0]], 2.5);
        assert_eq!(divisor[[1]], 2.0);
    }

    #[test]
    fn test_empty_stack_errors() {
        let err = get_mask(&[], ConsensusMethod::Sum, false).unwrap_err();
        assert!(matches!(err, MergeError::NotEnoughModels { .. }));
    }
}
