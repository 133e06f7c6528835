//! In-memory checkpoint: the tensors of a source model

use crate::error::ParseError;
use crate::types::{Tensor, TensorInfo};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

/// Tensors loaded from a source checkpoint
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    /// Source format identifier (e.g., "pytorch", "safetensors")
    pub format: String,
    /// Tensors in source order
    pub tensors: Vec<Tensor>,
    /// Free-form string metadata carried by the source file
    pub metadata: BTreeMap<String, String>,
}

impl Checkpoint {
    /// Create an empty checkpoint for the given format
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            ..Default::default()
        }
    }

    /// Add a tensor, rejecting duplicate names
    pub fn push(&mut self, tensor: Tensor) -> Result<(), ParseError> {
        if self.get(&tensor.name).is_some() {
            return Err(ParseError::DuplicateTensor(tensor.name));
        }
        self.tensors.push(tensor);
        Ok(())
    }

    /// Look up a tensor by name
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total bytes of tensor data
    pub fn total_bytes(&self) -> usize {
        self.tensors.iter().map(|t| t.data.len()).sum()
    }

    /// Total number of elements across all tensors
    pub fn parameter_count(&self) -> usize {
        self.tensors.iter().map(|t| t.num_elements()).sum()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.iter().map(|t| t.name.as_str())
    }

    pub fn tensor_info(&self) -> Vec<TensorInfo> {
        self.tensors.iter().map(Tensor::info).collect()
    }

    /// Rename tensors according to remap rules
    ///
    /// For each tensor the first rule whose pattern matches rewrites the
    /// name; later rules are not consulted. Returns the number of renamed
    /// tensors.
    pub fn remap(&mut self, rules: &[KeyRemap]) -> Result<usize, ParseError> {
        if rules.is_empty() {
            return Ok(0);
        }

        let mut renamed = 0;
        let mut seen = HashSet::with_capacity(self.tensors.len());

        for tensor in &mut self.tensors {
            if let Some(rule) = rules.iter().find(|r| r.pattern.is_match(&tensor.name)) {
                let new_name = rule.apply(&tensor.name);
                if new_name != tensor.name {
                    tracing::debug!(from = %tensor.name, to = %new_name, "remapped tensor");
                    tensor.name = new_name;
                    renamed += 1;
                }
            }

            if !seen.insert(tensor.name.clone()) {
                return Err(ParseError::DuplicateTensor(tensor.name.clone()));
            }
        }

        Ok(renamed)
    }
}

/// A key rewrite rule: regex pattern and replacement
#[derive(Debug, Clone)]
pub struct KeyRemap {
    pattern: Regex,
    replacement: String,
}

impl KeyRemap {
    /// Compile a rule; the replacement may use `$1`-style capture references
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    fn apply(&self, name: &str) -> String {
        self.pattern
            .replace_all(name, self.replacement.as_str())
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(names: &[&str]) -> Checkpoint {
        let mut ckpt = Checkpoint::new("test");
        for name in names {
            ckpt.push(Tensor::zeros(*name, vec![2]).unwrap()).unwrap();
        }
        ckpt
    }

    #[test]
    fn test_push_rejects_duplicates() {
        let mut ckpt = checkpoint(&["a"]);
        let result = ckpt.push(Tensor::zeros("a", vec![1]).unwrap());
        assert!(matches!(result, Err(ParseError::DuplicateTensor(name)) if name == "a"));
    }

    #[test]
    fn test_totals() {
        let ckpt = checkpoint(&["a", "b"]);
        assert_eq!(ckpt.len(), 2);
        assert_eq!(ckpt.parameter_count(), 4);
        assert_eq!(ckpt.total_bytes(), 16);
    }

    #[test]
    fn test_remap_first_match_wins() {
        let mut ckpt = checkpoint(&["generator.model.1.weight", "discriminator.bias"]);
        let rules = vec![
            KeyRemap::new(r"^generator\.model\.(\d+)\.", "conv$1.").unwrap(),
            KeyRemap::new(r"^generator\.", "gen.").unwrap(),
        ];

        let renamed = ckpt.remap(&rules).unwrap();
        assert_eq!(renamed, 1);
        assert!(ckpt.get("conv1.weight").is_some());
        assert!(ckpt.get("discriminator.bias").is_some());
    }

    #[test]
    fn test_remap_collision_fails() {
        let mut ckpt = checkpoint(&["a.weight", "b.weight"]);
        let rules = vec![KeyRemap::new(r"^[ab]\.", "x.").unwrap()];
        assert!(matches!(
            ckpt.remap(&rules),
            Err(ParseError::DuplicateTensor(name)) if name == "x.weight"
        ));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(KeyRemap::new("(unclosed", "").is_err());
    }
}
