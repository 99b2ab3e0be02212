//! Configuration types for nano-eagle.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sampling configuration for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
        }
    }
}

impl SamplingConfig {
    /// Arg-max sampling.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    /// Whether this configuration reduces to arg-max.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

/// Pipeline/tensor parallel layout of the serving process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Number of pipeline stages the target model is sharded across.
    pub pipeline_parallel_size: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            pipeline_parallel_size: 1,
        }
    }
}

/// Transformer configuration as found in a HuggingFace `config.json`.
///
/// Used for both the target and the draft model. Draft checkpoints add
/// `draft_vocab_size` (EAGLE-3) and may declare a different
/// `target_hidden_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (MLP).
    pub intermediate_size: usize,
    /// Number of transformer layers owned by this model.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of key-value heads (for GQA).
    pub num_key_value_heads: usize,
    /// Dimension per attention head (defaults to hidden / heads).
    #[serde(default)]
    pub head_dim: Option<usize>,
    /// RMSNorm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// RoPE theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Maximum sequence length.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Whether the LM head is tied to the embedding table.
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Reduced output vocabulary of an EAGLE-3 draft head.
    #[serde(default)]
    pub draft_vocab_size: Option<usize>,
    /// Hidden size of the target model feeding this draft (EAGLE-3).
    #[serde(default)]
    pub target_hidden_size: Option<usize>,
    /// Index of this model's first layer in the shared layer namespace.
    /// Zero for a target model; the target's layer count for a draft.
    #[serde(default)]
    pub layer_offset: usize,
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl ModelConfig {
    /// Load a config from a `config.json` file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// Number of query heads per KV head group (for GQA).
    pub fn num_kv_groups(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Hidden size of the target model this draft reads features from.
    pub fn target_hidden_size(&self) -> usize {
        self.target_hidden_size.unwrap_or(self.hidden_size)
    }

    /// Output vocabulary of the draft head.
    pub fn draft_vocab_size(&self) -> usize {
        self.draft_vocab_size.unwrap_or(self.vocab_size)
    }

    /// Check that the head layout is usable.
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 {
            return Err(Error::Config("attention head counts must be positive".into()));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(Error::Config(format!(
                "num_attention_heads {} is not a multiple of num_key_value_heads {}",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(Error::Config(format!(
                "head_dim {} must be even for RoPE",
                self.head_dim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_defaults() {
        let json = r#"{
            "vocab_size": 128256,
            "hidden_size": 4096,
            "intermediate_size": 14336,
            "num_hidden_layers": 1,
            "num_attention_heads": 32,
            "num_key_value_heads": 8
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.num_kv_groups(), 4);
        assert_eq!(config.draft_vocab_size(), 128256);
        assert_eq!(config.target_hidden_size(), 4096);
        assert_eq!(config.layer_offset, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_model_config_rejects_bad_gqa() {
        let json = r#"{
            "vocab_size": 100,
            "hidden_size": 48,
            "intermediate_size": 96,
            "num_hidden_layers": 1,
            "num_attention_heads": 6,
            "num_key_value_heads": 4
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_sampling_config_greedy() {
        assert!(SamplingConfig::greedy().is_greedy());
        assert!(!SamplingConfig::default().is_greedy());
    }
}
