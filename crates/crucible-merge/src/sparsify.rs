//! Sparsification kernels for task vectors.
//!
//! Sparsification reduces interference when merging models by keeping only a
//! `density` fraction of each task vector's entries and zeroing the rest.
//! All kernels are shape- and dtype-preserving.
//!
//! Thresholded kernels find the cut-off magnitude with Quickselect
//! (O(n) average) instead of a full sort. The stochastic kernels (bernoulli,
//! rank-magnitude sampling) take an explicit RNG so callers can seed them.

use ndarray::{ArrayD, Zip};
use rand::rngs::StdRng;
use rand::Rng;
use std::cmp::Ordering;

use crate::{MergeError, Result, SparsificationMethod, TensorParams, DEFAULT_EPSILON, DEFAULT_GAMMA};

/// Apply the configured sparsification method to a task-vector delta.
///
/// Method-specific extras come from `params` and fall back to their
/// documented defaults when the extras variant does not carry them.
/// `ConsensusTa` performs no pre-aggregation pruning and returns the delta
/// unchanged; `ConsensusTies` prunes by plain magnitude.
pub fn sparsify(
    delta: &ArrayD<f32>,
    density: f32,
    method: SparsificationMethod,
    rescale: bool,
    params: &TensorParams,
    rng: &mut StdRng,
) -> Result<ArrayD<f32>> {
    match method {
        SparsificationMethod::Magnitude | SparsificationMethod::ConsensusTies => {
            Ok(sparsify_magnitude(delta, density, rescale))
        }
        SparsificationMethod::MagnitudeOutliers => {
            let gamma = params.gamma().unwrap_or(DEFAULT_GAMMA);
            Ok(sparsify_magnitude_outliers(delta, density, rescale, gamma))
        }
        SparsificationMethod::Bernoulli => Ok(sparsify_bernoulli(delta, density, rescale, rng)),
        SparsificationMethod::RankMagnitudeSampling => {
            let epsilon = params.epsilon().unwrap_or(DEFAULT_EPSILON);
            sparsify_rank_magnitude(delta, density, rescale, epsilon, rng)
        }
        SparsificationMethod::ConsensusTa => Ok(delta.clone()),
    }
}

/// Keep only the top `density` fraction of entries by magnitude.
///
/// When `rescale` is set, surviving entries are scaled so the tensor's L1
/// mass matches the input's.
pub fn sparsify_magnitude(tensor: &ArrayD<f32>, density: f32, rescale: bool) -> ArrayD<f32> {
    if density >= 1.0 || tensor.is_empty() {
        return tensor.clone();
    }
    if density <= 0.0 {
        return ArrayD::zeros(tensor.raw_dim());
    }

    let n = tensor.len();
    let mut magnitudes: Vec<f32> = tensor.iter().map(|v| v.abs()).collect();

    let cut = ((1.0 - density) * n as f32).ceil() as usize;
    let cut = cut.min(n - 1);
    let threshold = quickselect(&mut magnitudes, cut);

    let mut out = tensor.mapv(|v| if v.abs() >= threshold { v } else { 0.0 });
    if rescale {
        rescale_l1(tensor, &mut out);
    }
    out
}

/// Keep the middle `density` fraction of entries: the `gamma` fraction of
/// largest-magnitude outliers is dropped first, then the smallest entries
/// are dropped to reach the target density (model breadcrumbs).
pub fn sparsify_magnitude_outliers(
    tensor: &ArrayD<f32>,
    density: f32,
    rescale: bool,
    gamma: f32,
) -> ArrayD<f32> {
    if (density >= 1.0 && gamma <= 0.0) || tensor.is_empty() {
        return tensor.clone();
    }

    let n = tensor.len();
    let mut indexed: Vec<(usize, f32)> = tensor
        .iter()
        .enumerate()
        .map(|(i, v)| (i, v.abs()))
        .collect();
    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    // Survivors are the sorted positions in [lower, upper): everything below
    // lower is noise, everything at or above upper is an outlier.
    let lower = ((1.0 - density) * n as f32).ceil() as usize;
    let upper = ((1.0 - gamma) * n as f32).floor() as usize;

    let mut keep = vec![false; n];
    for (idx, _) in indexed.iter().skip(lower).take(upper.saturating_sub(lower)) {
        keep[*idx] = true;
    }

    let mut out = tensor.clone();
    for (i, v) in out.iter_mut().enumerate() {
        if !keep[i] {
            *v = 0.0;
        }
    }
    if rescale {
        rescale_l1(tensor, &mut out);
    }
    out
}

/// Keep each entry independently with probability `density` (DARE).
///
/// When `rescale` is set, survivors are divided by `density` to preserve the
/// tensor's expected sum.
pub fn sparsify_bernoulli(
    tensor: &ArrayD<f32>,
    density: f32,
    rescale: bool,
    rng: &mut StdRng,
) -> ArrayD<f32> {
    if density >= 1.0 || tensor.is_empty() {
        return tensor.clone();
    }
    if density <= 0.0 {
        return ArrayD::zeros(tensor.raw_dim());
    }

    let mut out = tensor.clone();
    for v in out.iter_mut() {
        if rng.gen::<f32>() < density {
            if rescale {
                *v /= density;
            }
        } else {
            *v = 0.0;
        }
    }
    out
}

/// Keep entries with probability proportional to their per-row magnitude
/// rank (DELLA).
///
/// Each row's ranks are mapped linearly onto
/// `[density - epsilon, density + epsilon]`, so larger-magnitude entries are
/// more likely to survive while the expected density stays at `density`.
/// When `rescale` is set, survivors are divided by their keep probability.
///
/// `density` must lie strictly inside `(epsilon, 1 - epsilon)` so every
/// probability is valid.
pub fn sparsify_rank_magnitude(
    tensor: &ArrayD<f32>,
    density: f32,
    rescale: bool,
    epsilon: f32,
    rng: &mut StdRng,
) -> Result<ArrayD<f32>> {
    if density >= 1.0 || tensor.is_empty() {
        return Ok(tensor.clone());
    }
    if density <= epsilon || density >= 1.0 - epsilon {
        return Err(MergeError::InvalidConfig(format!(
            "rank-magnitude sampling requires density in ({epsilon}, {}), got {density}",
            1.0 - epsilon
        )));
    }

    // Rank per row of the leading axis; vectors are treated as one row.
    let n = tensor.len();
    let rows = if tensor.ndim() >= 2 {
        tensor.shape()[0].max(1)
    } else {
        1
    };
    let cols = n / rows;

    let flat: Vec<f32> = tensor.iter().copied().collect();
    let mut kept = vec![0.0f32; n];

    for r in 0..rows {
        let row = &flat[r * cols..(r + 1) * cols];
        let mut order: Vec<usize> = (0..cols).collect();
        order.sort_by(|&a, &b| {
            row[a]
                .abs()
                .partial_cmp(&row[b].abs())
                .unwrap_or(Ordering::Equal)
        });

        for (rank, &i) in order.iter().enumerate() {
            let norm = if cols > 1 {
                rank as f32 / (cols - 1) as f32
            } else {
                1.0
            };
            let p = (density - epsilon) + norm * (2.0 * epsilon);
            if rng.gen::<f32>() < p {
                kept[r * cols + i] = if rescale { row[i] / p } else { row[i] };
            }
        }
    }

    let mut out = tensor.clone();
    for (i, v) in out.iter_mut().enumerate() {
        *v = kept[i];
    }
    Ok(out)
}

/// Tall mask: marks the elements where a model's own delta dominates the
/// disagreement with the aggregated delta.
///
/// An element is tall when `|delta| > lambda * |mixed_delta - delta|`.
pub fn get_tall_mask(
    delta: &ArrayD<f32>,
    lambda: f32,
    mixed_delta: &ArrayD<f32>,
) -> ArrayD<bool> {
    let mut mask = ArrayD::from_elem(delta.raw_dim(), false);
    Zip::from(&mut mask)
        .and(delta)
        .and(mixed_delta)
        .for_each(|m, &d, &mixed| {
            *m = d.abs() > lambda * (mixed - d).abs();
        });
    mask
}

/// Find the k-th smallest element using Quickselect.
///
/// O(n) on average versus O(n log n) for a full sort. The slice is partially
/// reordered.
pub fn quickselect(data: &mut [f32], k: usize) -> f32 {
    if data.len() == 1 {
        return data[0];
    }
    let k = k.min(data.len() - 1);
    quickselect_impl(data, 0, data.len() - 1, k)
}

fn quickselect_impl(data: &mut [f32], left: usize, right: usize, k: usize) -> f32 {
    if left == right {
        return data[left];
    }

    let pivot_idx = median_of_three(data, left, right);
    let pivot_idx = partition(data, left, right, pivot_idx);

    match k.cmp(&pivot_idx) {
        Ordering::Equal => data[k],
        Ordering::Less => quickselect_impl(data, left, pivot_idx.saturating_sub(1), k),
        Ordering::Greater => quickselect_impl(data, pivot_idx + 1, right, k),
    }
}

fn median_of_three(data: &[f32], left: usize, right: usize) -> usize {
    let mid = left + (right - left) / 2;

    let a = data[left];
    let b = data[mid];
    let c = data[right];

    if (a <= b && b <= c) || (c <= b && b <= a) {
        mid
    } else if (b <= a && a <= c) || (c <= a && a <= b) {
        left
    } else {
        right
    }
}

fn partition(data: &mut [f32], left: usize, right: usize, pivot_idx: usize) -> usize {
    let pivot_value = data[pivot_idx];
    data.swap(pivot_idx, right);

    let mut store_idx = left;
    for i in left..right {
        if data[i] < pivot_value {
            data.swap(i, store_idx);
            store_idx += 1;
        }
    }

    data.swap(store_idx, right);
    store_idx
}

/// Scale `masked` so its L1 mass matches `original`'s. No-op when the masked
/// tensor is entirely zero.
fn rescale_l1(original: &ArrayD<f32>, masked: &mut ArrayD<f32>) {
    let kept: f32 = masked.iter().map(|v| v.abs()).sum();
    if kept <= f32::EPSILON {
        return;
    }
    let total: f32 = original.iter().map(|v| v.abs()).sum();
    masked.mapv_inplace(|v| v * (total / kept));
}
