//! Generalized task-arithmetic merging.
//!
//! One configurable pipeline subsumes task arithmetic (Ilharco et al., 2022),
//! TIES (Yadav et al., 2023), DARE (Yu et al., 2023), model breadcrumbs
//! (Davari & Belilovsky, 2023), DELLA (Deep et al., 2024), and the tall-mask
//! consensus methods (Wang et al., 2024). Each named method is a preset over
//! the same five stages, run in fixed order for every output weight:
//!
//! 1. extract task vectors from the base model
//! 2. sparsify each task vector (method dependent)
//! 3. elect a sign consensus and aggregate the weighted deltas
//! 4. normalize by the sum of effective weights and apply lambda scaling
//! 5. trim by tall-mask consensus (consensus methods only)
//!
//! A merge call is stateless and synchronous; scheduling calls across weight
//! names and devices belongs to the caller.

use ndarray::{ArrayD, Zip};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use tracing::debug;

use crucible_core::{ModelReference, Tensor, WeightInfo};

use crate::consensus::get_mask;
use crate::sparsify::{get_tall_mask, sparsify};
use crate::task_vector::{extract_task_vectors, Diagnostic, TaskVector, TensorMap};
use crate::{
    ConsensusMethod, GtaParameters, Result, SparsificationMethod, TensorParams, DEFAULT_K,
    DEFAULT_LAMBDA,
};

/// Result of merging one weight tensor.
#[derive(Debug, Clone)]
pub struct MergeOutput {
    /// The merged tensor, in the base tensor's shape and dtype.
    pub tensor: Tensor,
    /// Per-weight diagnostics (dropped or truncated contributions).
    pub diagnostics: Vec<Diagnostic>,
}

/// A generalized task-arithmetic merge method.
///
/// Construct directly from [`GtaParameters`] or through one of the named
/// presets ([`GtaMerge::ties`], [`GtaMerge::dare_ties`], ...).
#[derive(Debug, Clone)]
pub struct GtaMerge {
    name: &'static str,
    pretty_name: Option<&'static str>,
    reference_url: Option<&'static str>,
    parameters: GtaParameters,
}

impl GtaMerge {
    /// A merge with explicit parameters and no preset identity.
    pub fn new(parameters: GtaParameters) -> Self {
        Self {
            name: "generalized_task_arithmetic",
            pretty_name: None,
            reference_url: None,
            parameters,
        }
    }

    /// Plain task arithmetic: weighted sum of raw task vectors.
    pub fn task_arithmetic() -> Self {
        Self {
            name: "task_arithmetic",
            pretty_name: Some("Task Arithmetic"),
            reference_url: Some("https://arxiv.org/abs/2212.04089"),
            parameters: GtaParameters {
                sparsification: None,
                consensus: None,
                normalize: false,
                ..GtaParameters::default()
            },
        }
    }

    /// TIES: magnitude pruning plus sum-rule sign consensus.
    pub fn ties() -> Self {
        Self {
            name: "ties",
            pretty_name: Some("TIES"),
            reference_url: Some("https://arxiv.org/abs/2306.01708"),
            parameters: GtaParameters {
                sparsification: Some(SparsificationMethod::Magnitude),
                consensus: Some(ConsensusMethod::Sum),
                normalize: true,
                rescale: false,
                ..GtaParameters::default()
            },
        }
    }

    /// DARE with sign consensus: random pruning, rescale, TIES election.
    pub fn dare_ties() -> Self {
        Self {
            name: "dare_ties",
            pretty_name: Some("DARE TIES"),
            reference_url: Some("https://arxiv.org/abs/2311.03099"),
            parameters: GtaParameters {
                sparsification: Some(SparsificationMethod::Bernoulli),
                consensus: Some(ConsensusMethod::Sum),
                normalize: false,
                rescale: true,
                ..GtaParameters::default()
            },
        }
    }

    /// DARE without sign consensus.
    pub fn dare_linear() -> Self {
        Self {
            name: "dare_linear",
            pretty_name: Some("Linear DARE"),
            reference_url: Some("https://arxiv.org/abs/2311.03099"),
            parameters: GtaParameters {
                sparsification: Some(SparsificationMethod::Bernoulli),
                consensus: None,
                normalize: false,
                rescale: true,
                ..GtaParameters::default()
            },
        }
    }

    /// Model breadcrumbs: dual-sided magnitude pruning, no consensus.
    pub fn breadcrumbs() -> Self {
        Self {
            name: "breadcrumbs",
            pretty_name: Some("Model Breadcrumbs"),
            reference_url: Some("https://arxiv.org/abs/2312.06795"),
            parameters: GtaParameters {
                sparsification: Some(SparsificationMethod::MagnitudeOutliers),
                consensus: None,
                normalize: false,
                rescale: false,
                ..GtaParameters::default()
            },
        }
    }

    /// Model breadcrumbs with TIES sign consensus.
    pub fn breadcrumbs_ties() -> Self {
        Self {
            name: "breadcrumbs_ties",
            pretty_name: Some("Model Breadcrumbs + TIES"),
            reference_url: Some("https://arxiv.org/abs/2312.06795"),
            parameters: GtaParameters {
                sparsification: Some(SparsificationMethod::MagnitudeOutliers),
                consensus: Some(ConsensusMethod::Sum),
                normalize: false,
                rescale: false,
                ..GtaParameters::default()
            },
        }
    }

    /// DELLA: rank-magnitude sampling plus sum-rule sign consensus.
    pub fn della() -> Self {
        Self {
            name: "della",
            pretty_name: Some("DELLA"),
            reference_url: Some("https://arxiv.org/abs/2406.11617"),
            parameters: GtaParameters {
                sparsification: Some(SparsificationMethod::RankMagnitudeSampling),
                consensus: Some(ConsensusMethod::Sum),
                normalize: true,
                rescale: true,
                ..GtaParameters::default()
            },
        }
    }

    /// DELLA without sign consensus.
    pub fn della_linear() -> Self {
        Self {
            name: "della_linear",
            pretty_name: Some("Linear DELLA"),
            reference_url: Some("https://arxiv.org/abs/2406.11617"),
            parameters: GtaParameters {
                sparsification: Some(SparsificationMethod::RankMagnitudeSampling),
                consensus: None,
                normalize: false,
                rescale: true,
                ..GtaParameters::default()
            },
        }
    }

    /// Consensus task arithmetic: raw aggregation, tall-mask trim.
    pub fn consensus_ta() -> Self {
        Self {
            name: "consensus_ta",
            pretty_name: Some("Consensus Task Arithmetic"),
            reference_url: Some("https://arxiv.org/abs/2405.07813"),
            parameters: GtaParameters {
                sparsification: Some(SparsificationMethod::ConsensusTa),
                consensus: None,
                normalize: false,
                ..GtaParameters::default()
            },
        }
    }

    /// Consensus TIES: TIES aggregation followed by a tall-mask trim.
    pub fn consensus_ties() -> Self {
        Self {
            name: "consensus_ties",
            pretty_name: Some("Consensus TIES"),
            reference_url: Some("https://arxiv.org/abs/2405.07813"),
            parameters: GtaParameters {
                sparsification: Some(SparsificationMethod::ConsensusTies),
                consensus: Some(ConsensusMethod::Sum),
                normalize: true,
                ..GtaParameters::default()
            },
        }
    }

    /// Method name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Human-readable method name, when this is a named preset.
    pub fn pretty_name(&self) -> Option<&'static str> {
        self.pretty_name
    }

    /// Reference paper, when this is a named preset.
    pub fn reference_url(&self) -> Option<&'static str> {
        self.reference_url
    }

    /// The resolved per-call parameters.
    pub fn parameters(&self) -> &GtaParameters {
        &self.parameters
    }

    /// Override the per-call parameters, keeping the preset identity.
    pub fn with_parameters(mut self, parameters: GtaParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Merge one weight tensor across all models in `tensors`.
    ///
    /// `tensors` must contain the base model's tensor and is consumed by the
    /// call (entries are freed as they are processed). `tensor_params` must
    /// provide parameters for every non-base model in the map.
    ///
    /// When no non-base model contributes (empty map or every contribution
    /// skipped), the base tensor is returned unchanged.
    pub fn merge_tensor(
        &self,
        weight: &WeightInfo,
        base_model: &ModelReference,
        tensors: TensorMap,
        tensor_params: &HashMap<ModelReference, TensorParams>,
    ) -> Result<MergeOutput> {
        let (mut tvs, base, diagnostics) =
            extract_task_vectors(weight, base_model, tensors, tensor_params)?;
        if tvs.is_empty() {
            return Ok(MergeOutput {
                tensor: base,
                diagnostics,
            });
        }
        debug!(
            weight = %weight.name,
            method = self.name,
            models = tvs.len(),
            "merging task vectors"
        );

        let mut rng = match self.parameters.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        // Stage 2: sparsify. Original deltas are kept only when the
        // tall-mask stage will need them.
        let pre_sparsify = self
            .parameters
            .sparsification
            .filter(|m| m.prunes_before_aggregation());
        let keep_originals = self
            .parameters
            .sparsification
            .is_some_and(|m| m.uses_tall_mask());

        let mut weighted: Vec<ArrayD<f32>> = Vec::with_capacity(tvs.len());
        for tv in &mut tvs {
            let mut delta = if let Some(method) = pre_sparsify {
                let sparse = sparsify(
                    &tv.delta,
                    tv.params.density,
                    method,
                    self.parameters.rescale,
                    &tv.params,
                    &mut rng,
                )?;
                if !keep_originals {
                    drop(std::mem::take(&mut tv.delta));
                }
                sparse
            } else if keep_originals {
                tv.delta.clone()
            } else {
                std::mem::take(&mut tv.delta)
            };
            delta.mapv_inplace(|v| v * tv.params.weight);
            weighted.push(delta);
        }

        // Stage 3: sign consensus and aggregation.
        let weights: Vec<f32> = tvs.iter().map(|tv| tv.params.weight).collect();
        let (mut mixed, divisor) = match self.parameters.consensus {
            Some(method) => {
                let mask = get_mask(&weighted, method, self.parameters.int8_mask)?;

                let mut divisor = mask.weighted_divisor(&weights);
                divisor.mapv_inplace(|d| if d == 0.0 { 1.0 } else { d });

                let mut mixed = ArrayD::<f32>::zeros(base.data().raw_dim());
                for (i, mut delta) in weighted.into_iter().enumerate() {
                    mask.apply_inplace(i, &mut delta);
                    mixed += &delta;
                }
                (mixed, Divisor::Elementwise(divisor))
            }
            None => {
                let mut mixed = ArrayD::<f32>::zeros(base.data().raw_dim());
                for delta in &weighted {
                    mixed += delta;
                }
                drop(weighted);

                let mut total: f32 = weights.iter().sum();
                if total.abs() < 1e-8 {
                    total = 1.0;
                }
                (mixed, Divisor::Scalar(total))
            }
        };

        // Stage 4: normalization and lambda scaling.
        if self.parameters.normalize {
            match &divisor {
                Divisor::Elementwise(divisor) => {
                    Zip::from(&mut mixed).and(divisor).for_each(|m, &d| *m /= d);
                }
                Divisor::Scalar(divisor) => {
                    let d = *divisor;
                    mixed.mapv_inplace(|m| m / d);
                }
            }
        }
        if self.parameters.sparsification == Some(SparsificationMethod::RankMagnitudeSampling) {
            // All descriptors share the call-wide lambda; the first one's
            // value is authoritative.
            let lambda = tvs[0].params.lambda().unwrap_or(DEFAULT_LAMBDA);
            mixed.mapv_inplace(|m| m * lambda);
        }

        // Stage 5: tall-mask consensus trim.
        if keep_originals {
            trim_by_tall_masks(&mut mixed, &tvs);
        }

        let dtype = base.dtype();
        let merged = base.into_data() + mixed;
        Ok(MergeOutput {
            tensor: Tensor::from_array(merged, dtype),
            diagnostics,
        })
    }
}

enum Divisor {
    Elementwise(ArrayD<f32>),
    Scalar(f32),
}

/// Zero every element of `mixed` that fewer than `k` models mark as tall.
/// The threshold `k` comes from the first descriptor, like lambda above.
fn trim_by_tall_masks(mixed: &mut ArrayD<f32>, tvs: &[TaskVector]) {
    let k = tvs[0].params.k().unwrap_or(DEFAULT_K);

    let mut counts = ArrayD::<u32>::zeros(mixed.raw_dim());
    for tv in tvs {
        let lambda = tv.params.lambda().unwrap_or(DEFAULT_LAMBDA);
        let tall = get_tall_mask(&tv.delta, lambda, mixed);
        Zip::from(&mut counts).and(&tall).for_each(|c, &t| {
            if t {
                *c += 1;
            }
        });
    }

    Zip::from(mixed).and(&counts).for_each(|m, &c| {
        if c < k {
            *m = 0.0;
        }
    });
}
