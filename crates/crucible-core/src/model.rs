//! Model and weight identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a source model participating in a merge.
///
/// A reference is a path or repository identifier plus an optional adapter
/// (e.g. a LoRA directory applied on top of the base weights). References are
/// used as map keys and must stay cheap to clone, hash, and compare.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelReference {
    /// Model path or repository identifier.
    pub path: String,

    /// Optional adapter applied on top of the model.
    #[serde(default)]
    pub adapter: Option<String>,
}

impl ModelReference {
    /// Create a reference to a plain model.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            adapter: None,
        }
    }

    /// Create a reference to a model with an adapter applied.
    pub fn with_adapter(path: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            adapter: Some(adapter.into()),
        }
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.adapter {
            Some(adapter) => write!(f, "{}+{}", self.path, adapter),
            None => write!(f, "{}", self.path),
        }
    }
}

/// Identifies one named parameter tensor of the base architecture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeightInfo {
    /// Parameter name, e.g. `model.layers.0.mlp.down_proj.weight`.
    pub name: String,

    /// Whether this tensor has embedding-table semantics.
    ///
    /// Embedding tables may legitimately differ in vocabulary size between
    /// models; shape mismatches are resolved by truncation instead of
    /// dropping the contribution.
    #[serde(default)]
    pub is_embed: bool,
}

impl WeightInfo {
    /// Identity of an ordinary (non-embedding) weight.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_embed: false,
        }
    }

    /// Identity of an embedding-table weight.
    pub fn embed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_embed: true,
        }
    }
}

impl fmt::Display for WeightInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_model_reference_display() {
        let plain = ModelReference::new("org/model-a");
        assert_eq!(plain.to_string(), "org/model-a");

        let adapted = ModelReference::with_adapter("org/model-a", "org/lora-b");
        assert_eq!(adapted.to_string(), "org/model-a+org/lora-b");
    }

    #[test]
    fn test_model_reference_as_map_key() {
        let mut map = HashMap::new();
        map.insert(ModelReference::new("a"), 1);
        map.insert(ModelReference::with_adapter("a", "x"), 2);

        assert_eq!(map[&ModelReference::new("a")], 1);
        assert_eq!(map[&ModelReference::with_adapter("a", "x")], 2);
    }

    #[test]
    fn test_weight_info_embed_flag() {
        assert!(!WeightInfo::new("lm_head.weight").is_embed);
        assert!(WeightInfo::embed("model.embed_tokens.weight").is_embed);
    }
}
