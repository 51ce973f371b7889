//! Model lookup by name from a JSON manifest

use super::{Model, ModelName, ProjectorInfo, StaticMetadata};
use crate::error::{Result, SchedulerError};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Resolve a requested name; unknown or malformed names are `InvalidRequest`
    async fn resolve(&self, name: &str) -> Result<Arc<Model>>;

    /// Names of every model the catalog knows
    async fn list(&self) -> Vec<String>;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    models: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    name: String,
    path: PathBuf,
    #[serde(default)]
    digest: String,
    #[serde(default)]
    adapters: Vec<PathBuf>,
    #[serde(default)]
    projectors: Vec<ProjectorInfo>,
    metadata: StaticMetadata,
}

/// Catalog read from `{ "models": [ { "name", "path", "metadata": { "layer_count", "bytes_per_layer" } } ] }`
pub struct ManifestCatalog {
    models: HashMap<String, Arc<Model>>,
}

impl ManifestCatalog {
    /// Load a manifest; relative paths are taken relative to the manifest's directory
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model manifest: {}", path.display()))?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let catalog = Self::from_json(&raw, &base)
            .with_context(|| format!("Invalid model manifest: {}", path.display()))?;
        info!("Loaded {} model(s) from {}", catalog.models.len(), path.display());
        Ok(catalog)
    }

    pub fn from_json(raw: &str, base: &Path) -> anyhow::Result<Self> {
        let manifest: Manifest = serde_json::from_str(raw)?;
        let mut models = HashMap::new();

        for entry in manifest.models {
            let name = ModelName::parse(&entry.name)
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            let resolve = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };

            let model = Model {
                name: entry.name.clone(),
                digest: entry.digest,
                path: resolve(entry.path),
                adapters: entry.adapters.into_iter().map(resolve).collect(),
                projectors: entry
                    .projectors
                    .into_iter()
                    .map(|p| ProjectorInfo { path: resolve(p.path), byte_size: p.byte_size })
                    .collect(),
                metadata: Arc::new(entry.metadata),
            };

            if models.insert(name.canonical(), Arc::new(model)).is_some() {
                anyhow::bail!("duplicate model in manifest: {}", entry.name);
            }
        }

        Ok(Self { models })
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[async_trait]
impl ModelCatalog for ManifestCatalog {
    async fn resolve(&self, name: &str) -> Result<Arc<Model>> {
        let parsed = ModelName::parse(name)?;
        debug!("Resolving model {}", parsed.canonical());
        self.models
            .get(&parsed.canonical())
            .cloned()
            .ok_or_else(|| SchedulerError::InvalidRequest(format!("model {:?} not found", name)))
    }

    async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.values().map(|m| m.name.clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelMetadata;
    use std::io::Write;

    const MANIFEST: &str = r#"{
        "models": [
            {
                "name": "llama3:8b",
                "path": "weights/llama3-8b.gguf",
                "digest": "sha256:abc",
                "metadata": { "layer_count": 32, "bytes_per_layer": 1000 }
            },
            {
                "name": "llava",
                "path": "/models/llava.gguf",
                "projectors": [ { "path": "llava-proj.gguf", "byte_size": 600 } ],
                "metadata": { "layer_bytes": [10, 20], "projector_bytes": 5 }
            }
        ]
    }"#;

    #[tokio::test]
    async fn test_load_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(MANIFEST.as_bytes()).unwrap();

        let catalog = ManifestCatalog::load(&path).unwrap();
        assert_eq!(catalog.len(), 2);

        let llama = catalog.resolve("LLAMA3:8b").await.unwrap();
        assert_eq!(llama.digest, "sha256:abc");
        assert_eq!(llama.path, dir.path().join("weights/llama3-8b.gguf"));
        assert_eq!(llama.metadata.layer_count(), 32);

        let llava = catalog.resolve("llava:latest").await.unwrap();
        assert_eq!(llava.path, PathBuf::from("/models/llava.gguf"));
        assert_eq!(llava.projectors[0].path, dir.path().join("llava-proj.gguf"));
        assert!(llava.metadata.has_projector());
    }

    #[tokio::test]
    async fn test_unknown_and_empty_names() {
        let catalog = ManifestCatalog::from_json(MANIFEST, Path::new("/")).unwrap();
        assert!(matches!(catalog.resolve("mistral").await, Err(SchedulerError::InvalidRequest(_))));
        assert!(matches!(catalog.resolve("").await, Err(SchedulerError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let catalog = ManifestCatalog::from_json(MANIFEST, Path::new("/")).unwrap();
        assert_eq!(catalog.list().await, vec!["llama3:8b".to_string(), "llava".to_string()]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let raw = r#"{ "models": [
            { "name": "a", "path": "a.gguf", "metadata": {} },
            { "name": "A:latest", "path": "b.gguf", "metadata": {} }
        ] }"#;
        assert!(ManifestCatalog::from_json(raw, Path::new("/")).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(ManifestCatalog::load(Path::new("/nonexistent/models.json")).is_err());
    }
}
