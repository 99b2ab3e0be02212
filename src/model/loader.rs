//! Model loading utilities.
//!
//! This module provides:
//! - Resolving checkpoints from a local directory or the HuggingFace Hub
//! - Loading SafeTensors weights into a VarBuilder
//! - [`SafetensorsModelProvider`], the production draft model provider
//! - [`TargetWeights`], the target model weights the drafter may alias

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{debug, info};

use super::eagle::EagleDraftModel;
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::speculative::config::SpeculativeConfig;
use crate::speculative::interfaces::{DraftModel, ModelProvider, TargetModel};

/// Paths to a checkpoint's files.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// Path to config.json.
    pub config: PathBuf,
    /// Paths to weight files (SafeTensors).
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Use a checkpoint already on disk.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut weights: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        weights.sort();

        if weights.is_empty() {
            return Err(Error::ModelLoad(format!(
                "no SafeTensors weights in {}",
                dir.display()
            )));
        }
        Ok(Self {
            config: dir.join("config.json"),
            weights,
        })
    }

    /// Resolve `model_id` as a local directory if one exists, otherwise
    /// download it from the Hub.
    pub fn resolve(model_id: &str, revision: &str) -> Result<Self> {
        if Path::new(model_id).is_dir() {
            Self::from_dir(model_id)
        } else {
            download_model(model_id, revision)
        }
    }
}

/// Downloads model files from HuggingFace Hub.
///
/// # Arguments
///
/// * `model_id` - HuggingFace model ID (e.g., "yuhuili/EAGLE-LLaMA3.1-Instruct-8B")
/// * `revision` - Git revision (branch, tag, or commit hash)
pub fn download_model(model_id: &str, revision: &str) -> Result<ModelFiles> {
    let api = Api::new().map_err(|e| Error::ModelLoad(format!("Failed to create HF API: {e}")))?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    info!(model_id, revision, "Fetching checkpoint");
    let config = repo
        .get("config.json")
        .map_err(|e| Error::ModelLoad(format!("Failed to download config.json: {e}")))?;
    let weights = download_weights(&repo)?;

    Ok(ModelFiles { config, weights })
}

/// Downloads model weight files, single-file or sharded.
fn download_weights(repo: &hf_hub::api::sync::ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(path) = repo.get("model.safetensors") {
        return Ok(vec![path]);
    }

    if let Ok(index_path) = repo.get("model.safetensors.index.json") {
        let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
        let weight_map = index["weight_map"].as_object().ok_or_else(|| {
            Error::ModelLoad("Invalid safetensors index: missing weight_map".into())
        })?;

        let mut shard_files: Vec<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
        shard_files.sort_unstable();
        shard_files.dedup();

        return shard_files
            .into_iter()
            .map(|filename| {
                repo.get(filename)
                    .map_err(|e| Error::ModelLoad(format!("Failed to download {filename}: {e}")))
            })
            .collect();
    }

    Err(Error::ModelLoad(
        "No SafeTensors weights found. Only the SafeTensors format is supported.".into(),
    ))
}

/// Creates a VarBuilder from SafeTensors files.
///
/// # Safety
///
/// Uses memory-mapped file access. This is safe as long as the files are
/// not modified while being read.
#[allow(unsafe_code)]
pub fn load_safetensors(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Reads a config.json into a [`ModelConfig`].
pub fn load_config(path: &Path) -> Result<ModelConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::ModelLoad(format!("Failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::ModelLoad(format!("Failed to parse {}: {e}", path.display())))
}

/// Builds EAGLE heads from SafeTensors checkpoints.
#[derive(Debug, Clone)]
pub struct SafetensorsModelProvider {
    dtype: DType,
    device: Device,
}

impl SafetensorsModelProvider {
    /// Create a provider loading weights as `dtype` onto `device`.
    pub fn new(dtype: DType, device: Device) -> Self {
        Self { dtype, device }
    }
}

impl ModelProvider for SafetensorsModelProvider {
    fn draft_config(&self, config: &SpeculativeConfig) -> Result<ModelConfig> {
        let files = ModelFiles::resolve(&config.draft_model_id, &config.draft_revision)?;
        load_config(&files.config)
    }

    fn build_model(
        &self,
        config: &SpeculativeConfig,
        draft_config: &ModelConfig,
    ) -> Result<Box<dyn DraftModel>> {
        let files = ModelFiles::resolve(&config.draft_model_id, &config.draft_revision)?;
        debug!(shards = files.weights.len(), "Loading draft weights");
        let vb = load_safetensors(&files.weights, self.dtype, &self.device)?;
        Ok(Box::new(EagleDraftModel::new(draft_config, config.method, vb)?))
    }
}

/// Embedding table and LM head of a loaded target model.
#[derive(Debug, Clone)]
pub struct TargetWeights {
    config: ModelConfig,
    embed_tokens: Arc<Tensor>,
    lm_head: Arc<Tensor>,
}

impl TargetWeights {
    /// Wrap already loaded tensors.
    pub fn new(config: ModelConfig, embed_tokens: Arc<Tensor>, lm_head: Arc<Tensor>) -> Self {
        Self {
            config,
            embed_tokens,
            lm_head,
        }
    }

    /// Read `model.embed_tokens` and `lm_head` from a Llama-style checkpoint.
    /// Tied checkpoints get one tensor behind both handles.
    pub fn from_var_builder(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        let shape = (config.vocab_size, config.hidden_size);
        let embed_tokens = Arc::new(vb.get(shape, "model.embed_tokens.weight")?);
        let lm_head = if config.tie_word_embeddings {
            Arc::clone(&embed_tokens)
        } else {
            Arc::new(vb.get(shape, "lm_head.weight")?)
        };
        Ok(Self::new(config, embed_tokens, lm_head))
    }

    /// Load from a local directory or the Hub.
    pub fn load(model_id: &str, revision: &str, dtype: DType, device: &Device) -> Result<Self> {
        let files = ModelFiles::resolve(model_id, revision)?;
        let config = load_config(&files.config)?;
        let vb = load_safetensors(&files.weights, dtype, device)?;
        Self::from_var_builder(config, vb)
    }
}

impl TargetModel for TargetWeights {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn embed_tokens(&self) -> &Arc<Tensor> {
        &self.embed_tokens
    }

    fn lm_head(&self) -> &Arc<Tensor> {
        &self.lm_head
    }
}
