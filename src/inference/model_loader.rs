//! Model acquisition.
//!
//! A [`ModelSource`] turns a model id into a ready tokenizer + generator.
//! [`HubModelSource`] fetches artifacts from the Hugging Face hub (reusing
//! the hub's on-disk cache) and builds a candle Llama model from them.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::Device;
use hf_hub::api::tokio::{Api, ApiBuilder, ApiError, ApiRepo};
use hf_hub::{Repo, RepoType};
use thiserror::Error;
use tracing::{debug, info};

use crate::inference::engine::{PromptTokenizer, TextGenerator};
use crate::inference::llama;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("failed to fetch {file} from the model hub: {source}")]
    Fetch {
        file: String,
        #[source]
        source: ApiError,
    },

    #[error("model hub client unavailable: {0}")]
    Hub(#[source] ApiError),

    #[error("invalid model configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),

    #[error("failed to load tokenizer: {0}")]
    Tokenizer(String),

    #[error("failed to construct model: {0}")]
    Construct(#[from] candle_core::Error),

    #[error("compute device unavailable: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("model source unavailable: {0}")]
    Unavailable(String),

    #[error("model loading worker stopped unexpectedly: {0}")]
    Worker(String),
}

/// Identifies the one model this process serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    pub revision: String,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: revision.into(),
        }
    }
}

/// The halves of an engine as produced by a source.
pub struct LoadedModel {
    pub tokenizer: Arc<dyn PromptTokenizer>,
    pub generator: Arc<dyn TextGenerator>,
}

/// Artifact store + model construction, kept behind a narrow seam so tests
/// never touch the network or disk.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn load_model(
        &self,
        spec: &ModelSpec,
        device: &Device,
    ) -> Result<LoadedModel, ModelLoadError>;
}

/// Loads causal LMs from the Hugging Face hub.
#[derive(Debug, Clone, Default)]
pub struct HubModelSource {
    cache_dir: Option<PathBuf>,
}

impl HubModelSource {
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self { cache_dir }
    }

    fn api(&self) -> Result<Api, ModelLoadError> {
        let mut builder = ApiBuilder::new()
            .with_progress(false)
            .with_token(std::env::var("HF_TOKEN").ok());
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        builder.build().map_err(ModelLoadError::Hub)
    }
}

async fn fetch(repo: &ApiRepo, file: &str) -> Result<PathBuf, ModelLoadError> {
    let path = repo.get(file).await.map_err(|source| ModelLoadError::Fetch {
        file: file.to_string(),
        source,
    })?;
    debug!(file, path = %path.display(), "Fetched model artifact");
    Ok(path)
}

const SHARD_INDEX: &str = "model.safetensors.index.json";

/// Whether the hub answered that the file does not exist in the repo.
fn is_not_found(e: &ApiError) -> bool {
    match e {
        ApiError::RequestError(e) => e.status().is_some_and(|s| s.as_u16() == 404),
        ApiError::TooManyRetries(inner) => is_not_found(inner),
        _ => false,
    }
}

/// List the shard files named in a `model.safetensors.index.json`.
pub fn safetensors_shards(index: &Path) -> Result<Vec<String>, ModelLoadError> {
    let data = std::fs::read_to_string(index)?;
    let json: serde_json::Value = serde_json::from_str(&data)?;
    let weight_map = json
        .get("weight_map")
        .and_then(|m| m.as_object())
        .ok_or_else(|| {
            ModelLoadError::Unavailable(format!("no weight_map in {}", index.display()))
        })?;

    let shards: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Ok(shards.into_iter().collect())
}

#[async_trait]
impl ModelSource for HubModelSource {
    async fn load_model(
        &self,
        spec: &ModelSpec,
        device: &Device,
    ) -> Result<LoadedModel, ModelLoadError> {
        let api = self.api()?;
        let repo = api.repo(Repo::with_revision(
            spec.id.clone(),
            RepoType::Model,
            spec.revision.clone(),
        ));

        let config_path = fetch(&repo, "config.json").await?;
        let tokenizer_path = fetch(&repo, "tokenizer.json").await?;

        // Sharded checkpoints ship an index; small models ship one file.
        let weights = match repo.get(SHARD_INDEX).await {
            Ok(index) => {
                let mut paths = Vec::new();
                for shard in safetensors_shards(&index)? {
                    paths.push(fetch(&repo, &shard).await?);
                }
                paths
            }
            Err(e) if is_not_found(&e) => {
                debug!(model = spec.id, "No shard index, fetching a single weights file");
                vec![fetch(&repo, "model.safetensors").await?]
            }
            Err(source) => {
                return Err(ModelLoadError::Fetch {
                    file: SHARD_INDEX.to_string(),
                    source,
                })
            }
        };

        info!(
            model = spec.id,
            shards = weights.len(),
            "Model artifacts available, building engine"
        );

        let device = device.clone();
        tokio::task::spawn_blocking(move || {
            llama::build(&config_path, &tokenizer_path, &weights, device)
        })
        .await
        .map_err(|e| ModelLoadError::Worker(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_shards_are_deduplicated_and_sorted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"metadata": {{}}, "weight_map": {{
                "a.weight": "model-00002-of-00002.safetensors",
                "b.weight": "model-00001-of-00002.safetensors",
                "c.weight": "model-00001-of-00002.safetensors"
            }}}}"#
        )
        .unwrap();

        let shards = safetensors_shards(file.path()).unwrap();
        assert_eq!(
            shards,
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string(),
            ]
        );
    }

    #[test]
    fn test_transport_errors_are_not_missing_files() {
        let io = ApiError::IoError(std::io::Error::other("connection reset"));
        assert!(!is_not_found(&io));
        assert!(!is_not_found(&ApiError::TooManyRetries(Box::new(io))));
    }

    #[test]
    fn test_index_without_weight_map() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"metadata": {{}}}}"#).unwrap();
        assert!(matches!(
            safetensors_shards(file.path()),
            Err(ModelLoadError::Unavailable(_))
        ));
    }
}
