//! Model identity and the metadata the memory estimator consumes

pub mod catalog;
pub mod name;

pub use catalog::{ManifestCatalog, ModelCatalog};
pub use name::ModelName;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Sizing facts about a model, as reported by the model-format reader
pub trait ModelMetadata: Send + Sync + fmt::Debug {
    /// Number of repeating transformer blocks
    fn layer_count(&self) -> u64;

    /// Weight bytes of block `index`
    fn layer_byte_size(&self, index: u64) -> u64;

    /// Whether the model file embeds a multimodal projector
    fn has_projector(&self) -> bool {
        false
    }

    fn projector_byte_size(&self) -> u64 {
        0
    }

    /// KV cache bytes needed per context token, summed over all layers
    fn context_bytes_per_token(&self) -> u64 {
        0
    }

    /// Weight bytes of all blocks; `None` when the sum overflows
    fn total_layer_bytes(&self) -> Option<u64> {
        (0..self.layer_count()).try_fold(0u64, |total, i| total.checked_add(self.layer_byte_size(i)))
    }
}

/// Metadata given as plain numbers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticMetadata {
    /// Per-layer sizes; when empty, `layer_count` layers of `bytes_per_layer` are assumed
    #[serde(default)]
    pub layer_bytes: Vec<u64>,
    #[serde(default)]
    pub layer_count: u64,
    #[serde(default)]
    pub bytes_per_layer: u64,
    #[serde(default)]
    pub projector_bytes: u64,
    #[serde(default)]
    pub context_bytes_per_token: u64,
}

impl StaticMetadata {
    /// `count` layers of identical size
    pub fn uniform(count: u64, bytes_per_layer: u64) -> Self {
        Self {
            layer_count: count,
            bytes_per_layer,
            ..Default::default()
        }
    }

    pub fn with_projector(mut self, bytes: u64) -> Self {
        self.projector_bytes = bytes;
        self
    }

    pub fn with_context_bytes_per_token(mut self, bytes: u64) -> Self {
        self.context_bytes_per_token = bytes;
        self
    }
}

impl ModelMetadata for StaticMetadata {
    fn layer_count(&self) -> u64 {
        if self.layer_bytes.is_empty() {
            self.layer_count
        } else {
            self.layer_bytes.len() as u64
        }
    }

    fn layer_byte_size(&self, index: u64) -> u64 {
        if self.layer_bytes.is_empty() {
            if index < self.layer_count {
                self.bytes_per_layer
            } else {
                0
            }
        } else {
            self.layer_bytes.get(index as usize).copied().unwrap_or(0)
        }
    }

    fn has_projector(&self) -> bool {
        self.projector_bytes > 0
    }

    fn projector_byte_size(&self) -> u64 {
        self.projector_bytes
    }

    fn context_bytes_per_token(&self) -> u64 {
        self.context_bytes_per_token
    }
}

/// A projector file loaded next to the model (`--mmproj`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectorInfo {
    pub path: PathBuf,
    pub byte_size: u64,
}

/// A resolved model: identity plus everything needed to size and launch it
#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    /// Content digest of the weights; part of runner compatibility
    pub digest: String,
    pub path: PathBuf,
    pub adapters: Vec<PathBuf>,
    pub projectors: Vec<ProjectorInfo>,
    pub metadata: Arc<dyn ModelMetadata>,
}

impl Model {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, metadata: Arc<dyn ModelMetadata>) -> Self {
        Self {
            name: name.into(),
            digest: String::new(),
            path: path.into(),
            adapters: Vec::new(),
            projectors: Vec::new(),
            metadata,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = digest.into();
        self
    }

    pub fn with_adapter(mut self, adapter: impl Into<PathBuf>) -> Self {
        self.adapters.push(adapter.into());
        self
    }

    pub fn with_projector(mut self, projector: ProjectorInfo) -> Self {
        self.projectors.push(projector);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_metadata() {
        let meta = StaticMetadata::uniform(4, 100);
        assert_eq!(meta.layer_count(), 4);
        assert_eq!(meta.layer_byte_size(3), 100);
        assert_eq!(meta.layer_byte_size(4), 0);
        assert_eq!(meta.total_layer_bytes(), Some(400));
        assert!(!meta.has_projector());
    }

    #[test]
    fn test_explicit_layer_sizes_win() {
        let meta = StaticMetadata {
            layer_bytes: vec![10, 20, 30],
            layer_count: 99,
            bytes_per_layer: 1,
            ..Default::default()
        };
        assert_eq!(meta.layer_count(), 3);
        assert_eq!(meta.total_layer_bytes(), Some(60));
    }

    #[test]
    fn test_total_layer_bytes_overflow() {
        let meta = StaticMetadata::uniform(3, u64::MAX / 2);
        assert_eq!(meta.total_layer_bytes(), None);
    }

    #[test]
    fn test_projector_flag_follows_size() {
        let meta = StaticMetadata::uniform(1, 1).with_projector(512);
        assert!(meta.has_projector());
        assert_eq!(meta.projector_byte_size(), 512);
    }
}
