//! Configuration types for generalized task-arithmetic merging.
//!
//! The configuration here is already *resolved*: parsing YAML or CLI input
//! into these types is the caller's responsibility. Method enums are closed,
//! and the per-model extra parameters are attached through typed constructors
//! so that a parameter can never be present-but-ignored for the configured
//! method.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{MergeError, Result};

/// Default density (keep everything).
pub const DEFAULT_DENSITY: f32 = 1.0;
/// Default outlier fraction for magnitude-outlier pruning.
pub const DEFAULT_GAMMA: f32 = 0.01;
/// Default probability half-range for rank-magnitude sampling.
pub const DEFAULT_EPSILON: f32 = 0.15;
/// Default task-vector scaling factor.
pub const DEFAULT_LAMBDA: f32 = 1.0;
/// Default tall-mask agreement threshold.
pub const DEFAULT_K: u32 = 1;

/// Sparsification strategy applied to task vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparsificationMethod {
    /// Keep the top `density` fraction of entries by magnitude.
    Magnitude,
    /// Magnitude pruning that also drops the `gamma` fraction of largest
    /// outliers (model breadcrumbs).
    MagnitudeOutliers,
    /// Keep each entry independently with probability `density` (DARE).
    Bernoulli,
    /// Keep entries with probability proportional to their magnitude rank
    /// (DELLA).
    RankMagnitudeSampling,
    /// No pre-aggregation pruning; trim with tall masks after aggregation.
    ConsensusTa,
    /// Magnitude pruning before aggregation plus tall-mask trim after.
    ConsensusTies,
}

impl SparsificationMethod {
    /// Whether task vectors are pruned before aggregation.
    ///
    /// Only `consensus_ta` defers all pruning to the post-aggregation
    /// tall-mask stage.
    pub fn prunes_before_aggregation(self) -> bool {
        !matches!(self, SparsificationMethod::ConsensusTa)
    }

    /// Whether the post-aggregation tall-mask consensus filter applies.
    pub fn uses_tall_mask(self) -> bool {
        matches!(
            self,
            SparsificationMethod::ConsensusTa | SparsificationMethod::ConsensusTies
        )
    }
}

impl fmt::Display for SparsificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SparsificationMethod::Magnitude => "magnitude",
            SparsificationMethod::MagnitudeOutliers => "magnitude_outliers",
            SparsificationMethod::Bernoulli => "bernoulli",
            SparsificationMethod::RankMagnitudeSampling => "rank_magnitude_sampling",
            SparsificationMethod::ConsensusTa => "consensus_ta",
            SparsificationMethod::ConsensusTies => "consensus_ties",
        };
        write!(f, "{name}")
    }
}

impl FromStr for SparsificationMethod {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "magnitude" => Ok(SparsificationMethod::Magnitude),
            "magnitude_outliers" => Ok(SparsificationMethod::MagnitudeOutliers),
            "bernoulli" | "random" => Ok(SparsificationMethod::Bernoulli),
            "rank_magnitude_sampling" => Ok(SparsificationMethod::RankMagnitudeSampling),
            "consensus_ta" => Ok(SparsificationMethod::ConsensusTa),
            "consensus_ties" => Ok(SparsificationMethod::ConsensusTies),
            other => Err(MergeError::UnsupportedMethod {
                kind: "sparsification",
                name: other.to_string(),
            }),
        }
    }
}

/// Sign-consensus voting rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMethod {
    /// Majority sign from the count of positive vs negative signs.
    Count,
    /// Majority sign from the sum of the weighted deltas (TIES).
    Sum,
}

impl fmt::Display for ConsensusMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsensusMethod::Count => "count",
            ConsensusMethod::Sum => "sum",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ConsensusMethod {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "count" => Ok(ConsensusMethod::Count),
            "sum" => Ok(ConsensusMethod::Sum),
            other => Err(MergeError::UnsupportedMethod {
                kind: "consensus",
                name: other.to_string(),
            }),
        }
    }
}

/// Method-specific extra parameters carried by a model's tensor parameters.
///
/// Each variant owns exactly the extras its sparsification method needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodExtras {
    /// No extras (plain or magnitude pruning).
    None,
    /// Extras for magnitude-outlier pruning.
    MagnitudeOutliers {
        /// Fraction of largest-magnitude entries dropped as outliers.
        gamma: f32,
    },
    /// Extras for rank-magnitude sampling.
    RankMagnitudeSampling {
        /// Half-range of the keep-probability interval around `density`.
        epsilon: f32,
        /// Scaling factor applied to the aggregated delta.
        lambda: f32,
    },
    /// Extras for the consensus (tall-mask) variants.
    Consensus {
        /// Minimum number of models that must mark an element as tall.
        k: u32,
        /// Tall-mask sensitivity.
        lambda: f32,
    },
}

/// Per-model tensor parameters for one merge call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TensorParams {
    /// Weight of this model's contribution.
    pub weight: f32,
    /// Fraction of delta entries kept by sparsification.
    pub density: f32,
    /// Method-specific extras.
    pub extras: MethodExtras,
}

impl TensorParams {
    /// Parameters for plain or magnitude-pruned merging.
    pub fn new(weight: f32) -> Self {
        Self {
            weight,
            density: DEFAULT_DENSITY,
            extras: MethodExtras::None,
        }
    }

    /// Override the density.
    pub fn with_density(mut self, density: f32) -> Self {
        self.density = density;
        self
    }

    /// Parameters for magnitude-outlier pruning.
    pub fn magnitude_outliers(weight: f32, density: f32, gamma: f32) -> Self {
        Self {
            weight,
            density,
            extras: MethodExtras::MagnitudeOutliers { gamma },
        }
    }

    /// Parameters for rank-magnitude sampling.
    pub fn rank_magnitude(weight: f32, density: f32, epsilon: f32, lambda: f32) -> Self {
        Self {
            weight,
            density,
            extras: MethodExtras::RankMagnitudeSampling { epsilon, lambda },
        }
    }

    /// Parameters for the consensus (tall-mask) variants.
    pub fn consensus(weight: f32, density: f32, k: u32, lambda: f32) -> Self {
        Self {
            weight,
            density,
            extras: MethodExtras::Consensus { k, lambda },
        }
    }

    /// Outlier fraction, when carried by the extras.
    pub fn gamma(&self) -> Option<f32> {
        match self.extras {
            MethodExtras::MagnitudeOutliers { gamma } => Some(gamma),
            _ => None,
        }
    }

    /// Sampling half-range, when carried by the extras.
    pub fn epsilon(&self) -> Option<f32> {
        match self.extras {
            MethodExtras::RankMagnitudeSampling { epsilon, .. } => Some(epsilon),
            _ => None,
        }
    }

    /// Scaling factor, when carried by the extras.
    pub fn lambda(&self) -> Option<f32> {
        match self.extras {
            MethodExtras::RankMagnitudeSampling { lambda, .. } => Some(lambda),
            MethodExtras::Consensus { lambda, .. } => Some(lambda),
            _ => None,
        }
    }

    /// Tall-mask agreement threshold, when carried by the extras.
    pub fn k(&self) -> Option<u32> {
        match self.extras {
            MethodExtras::Consensus { k, .. } => Some(k),
            _ => None,
        }
    }
}

/// Resolved per-call parameters for a generalized task-arithmetic merge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GtaParameters {
    /// Sparsification strategy, if any.
    #[serde(default)]
    pub sparsification: Option<SparsificationMethod>,

    /// Sign-consensus rule, if any.
    #[serde(default)]
    pub consensus: Option<ConsensusMethod>,

    /// Store consensus masks compactly (one byte per element).
    /// Memory optimization only; results are identical.
    #[serde(default)]
    pub int8_mask: bool,

    /// Divide the aggregated delta by the sum of effective weights.
    #[serde(default = "default_true")]
    pub normalize: bool,

    /// Rescale sparsified deltas to preserve their original magnitude.
    #[serde(default)]
    pub rescale: bool,

    /// Seed for the stochastic sparsification kernels. `None` draws entropy;
    /// set a seed for a fully deterministic merge.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Default for GtaParameters {
    fn default() -> Self {
        Self {
            sparsification: None,
            consensus: None,
            int8_mask: false,
            normalize: true,
            rescale: false,
            seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names_roundtrip() {
        for method in [
            SparsificationMethod::Magnitude,
            SparsificationMethod::MagnitudeOutliers,
            SparsificationMethod::Bernoulli,
            SparsificationMethod::RankMagnitudeSampling,
            SparsificationMethod::ConsensusTa,
            SparsificationMethod::ConsensusTies,
        ] {
            let parsed: SparsificationMethod = method.to_string().parse().unwrap();
            assert_eq!(parsed, method);
        }

        assert_eq!(
            "random".parse::<SparsificationMethod>().unwrap(),
            SparsificationMethod::Bernoulli
        );
    }

    #[test]
    fn test_unknown_method_is_fatal() {
        let err = "approximate".parse::<ConsensusMethod>().unwrap_err();
        assert!(matches!(
            err,
            MergeError::UnsupportedMethod {
                kind: "consensus",
                ..
            }
        ));

        assert!("wanda".parse::<SparsificationMethod>().is_err());
    }

    #[test]
    fn test_extras_match_their_method() {
        let plain = TensorParams::new(1.0).with_density(0.5);
        assert_eq!(plain.gamma(), None);
        assert_eq!(plain.k(), None);

        let bc = TensorParams::magnitude_outliers(1.0, 0.8, 0.02);
        assert_eq!(bc.gamma(), Some(0.02));
        assert_eq!(bc.lambda(), None);

        let della = TensorParams::rank_magnitude(0.7, 0.5, 0.1, 1.1);
        assert_eq!(della.epsilon(), Some(0.1));
        assert_eq!(della.lambda(), Some(1.1));

        let tall = TensorParams::consensus(1.0, 1.0, 2, 0.6);
        assert_eq!(tall.k(), Some(2));
        assert_eq!(tall.lambda(), Some(0.6));
    }

    #[test]
    fn test_only_consensus_ta_skips_pruning() {
        assert!(!SparsificationMethod::ConsensusTa.prunes_before_aggregation());
        assert!(SparsificationMethod::ConsensusTies.prunes_before_aggregation());
        assert!(SparsificationMethod::ConsensusTa.uses_tall_mask());
        assert!(SparsificationMethod::ConsensusTies.uses_tall_mask());
        assert!(!SparsificationMethod::Magnitude.uses_tall_mask());
    }
}
