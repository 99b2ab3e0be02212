//! Speculative decoding configuration.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Drafting method, resolved once when the session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftMethod {
    /// EAGLE: the draft head predicts in the target vocabulary.
    Eagle,
    /// EAGLE-3: the draft head has its own (reduced) output vocabulary.
    Eagle3,
}

/// Vocabulary the draft head's logits are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRepresentation {
    /// Same space as the target LM head.
    TargetVocab,
    /// A draft-only vocabulary mapped back to target ids.
    DraftVocab,
}

/// Behaviour switches derived from a [`DraftMethod`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodStrategy {
    /// Alias the draft LM head to the target LM head.
    pub shares_lm_head: bool,
    /// Project concatenated auxiliary target hidden states before drafting.
    pub combines_hidden_states: bool,
    /// Output space of the draft head.
    pub output: OutputRepresentation,
}

impl DraftMethod {
    /// Resolve the per-method strategy record.
    pub fn strategy(self) -> MethodStrategy {
        match self {
            DraftMethod::Eagle => MethodStrategy {
                shares_lm_head: true,
                combines_hidden_states: false,
                output: OutputRepresentation::TargetVocab,
            },
            DraftMethod::Eagle3 => MethodStrategy {
                shares_lm_head: false,
                combines_hidden_states: true,
                output: OutputRepresentation::DraftVocab,
            },
        }
    }

    /// Canonical config string.
    pub fn as_str(self) -> &'static str {
        match self {
            DraftMethod::Eagle => "eagle",
            DraftMethod::Eagle3 => "eagle3",
        }
    }
}

impl FromStr for DraftMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eagle" => Ok(DraftMethod::Eagle),
            "eagle3" => Ok(DraftMethod::Eagle3),
            other => Err(Error::Config(format!("unknown drafting method {other:?}"))),
        }
    }
}

impl fmt::Display for DraftMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where sampled draft tokens live between drafting steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenResidency {
    /// Read each step's tokens back to the host before the next step.
    #[default]
    Host,
    /// Keep tokens on the device and read the whole draft back once.
    Device,
}

/// Configuration for speculative decoding.
///
/// A small EAGLE head drafts K tokens per request, which the target model
/// verifies in a single forward pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculativeConfig {
    /// Drafting method.
    pub method: DraftMethod,

    /// Number of tokens to speculate per iteration (K). Fixed per session.
    pub num_speculative_tokens: usize,

    /// Target model HuggingFace ID or local path.
    pub target_model_id: String,

    /// Draft model HuggingFace ID or local path.
    pub draft_model_id: String,

    /// Draft model revision (branch, tag, or commit hash).
    pub draft_revision: String,

    /// Positions at or beyond this length are not written to the cache.
    pub max_model_len: usize,

    /// Host/device placement of tokens inside the draft loop.
    #[serde(default)]
    pub token_residency: TokenResidency,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            method: DraftMethod::Eagle,
            num_speculative_tokens: 4,
            target_model_id: "meta-llama/Llama-3.1-8B-Instruct".to_string(),
            draft_model_id: "yuhuili/EAGLE-LLaMA3.1-Instruct-8B".to_string(),
            draft_revision: "main".to_string(),
            max_model_len: 4096,
            token_residency: TokenResidency::Host,
        }
    }
}

impl SpeculativeConfig {
    /// Create a new speculative config with the given draft model.
    pub fn new(draft_model_id: impl Into<String>) -> Self {
        Self {
            draft_model_id: draft_model_id.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON file and validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid speculative config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the drafting method.
    pub fn method(mut self, method: DraftMethod) -> Self {
        self.method = method;
        self
    }

    /// Set the number of speculative tokens.
    pub fn num_tokens(mut self, k: usize) -> Self {
        self.num_speculative_tokens = k;
        self
    }

    /// Set the target model.
    pub fn target(mut self, target_model_id: impl Into<String>) -> Self {
        self.target_model_id = target_model_id.into();
        self
    }

    /// Set the draft model revision.
    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.draft_revision = revision.into();
        self
    }

    /// Set the maximum model length.
    pub fn max_model_len(mut self, max_model_len: usize) -> Self {
        self.max_model_len = max_model_len;
        self
    }

    /// Set the token residency.
    pub fn token_residency(mut self, residency: TokenResidency) -> Self {
        self.token_residency = residency;
        self
    }

    /// Strategy record for the configured method.
    pub fn strategy(&self) -> MethodStrategy {
        self.method.strategy()
    }

    /// Reject configurations that cannot start a session.
    pub fn validate(&self) -> Result<()> {
        if self.num_speculative_tokens == 0 {
            return Err(Error::Config(
                "num_speculative_tokens must be at least 1".into(),
            ));
        }
        if self.max_model_len == 0 {
            return Err(Error::Config("max_model_len must be positive".into()));
        }
        Ok(())
    }

    /// Target layers whose hidden states an EAGLE-3 head consumes.
    ///
    /// The target concatenates these layers' outputs (`3 * hidden`) and the
    /// draft head projects them back down.
    pub fn aux_hidden_state_layers(&self, num_target_layers: usize) -> Vec<usize> {
        vec![
            2.min(num_target_layers.saturating_sub(1)),
            num_target_layers / 2,
            num_target_layers.saturating_sub(3),
        ]
    }
}
