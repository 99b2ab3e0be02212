//! Decoder layers of the EAGLE draft heads.
//!
//! EAGLE layers are plain pre-norm Llama layers, except that the first one
//! skips its input norm: its input is already the fused
//! `fc([embeds, features])` projection.
//!
//! The EAGLE-3 midlayer normalizes embeddings and target features
//! separately and attends over their concatenation:
//!
//! ```text
//! embeds ──► input_layernorm ──┐
//!                              ├─ cat ─► self_attn ─► (+residual) ─► norm ─► mlp
//! features ─► hidden_norm ─────┘                          ▲
//! features ───────────────────────────────────────────────┘
//! ```

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::attention::PagedAttention;
use super::mlp::SwiGluMlp;
use super::norm::RmsNorm;
use crate::config::ModelConfig;
use crate::core::kv_cache::DraftKvCache;
use crate::error::Result;
use crate::speculative::interfaces::DraftBatch;

/// One decoder layer of a draft head.
#[derive(Debug, Clone)]
pub struct EagleDecoderLayer {
    /// Absent on the first EAGLE layer.
    input_layernorm: Option<RmsNorm>,
    /// Norm over target features, EAGLE-3 only.
    hidden_norm: Option<RmsNorm>,
    self_attn: PagedAttention,
    post_attention_layernorm: RmsNorm,
    mlp: SwiGluMlp,
}

impl EagleDecoderLayer {
    /// EAGLE layer `index` of the draft head.
    pub fn new_eagle(
        config: &ModelConfig,
        index: usize,
        layer_name: impl Into<String>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let h = config.hidden_size;
        let eps = config.rms_norm_eps;
        let input_layernorm = if index == 0 {
            None
        } else {
            Some(RmsNorm::load(h, eps, vb.pp("input_layernorm"))?)
        };

        Ok(Self {
            input_layernorm,
            hidden_norm: None,
            self_attn: PagedAttention::new(config, h, layer_name, vb.pp("self_attn"))?,
            post_attention_layernorm: RmsNorm::load(h, eps, vb.pp("post_attention_layernorm"))?,
            mlp: SwiGluMlp::new(h, config.intermediate_size, vb.pp("mlp"))?,
        })
    }

    /// EAGLE-3 midlayer, attending over `[embeds, features]` (`2 * hidden`).
    pub fn new_eagle3(
        config: &ModelConfig,
        layer_name: impl Into<String>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let h = config.hidden_size;
        let eps = config.rms_norm_eps;

        Ok(Self {
            input_layernorm: Some(RmsNorm::load(h, eps, vb.pp("input_layernorm"))?),
            hidden_norm: Some(RmsNorm::load(h, eps, vb.pp("hidden_norm"))?),
            self_attn: PagedAttention::new(config, 2 * h, layer_name, vb.pp("self_attn"))?,
            post_attention_layernorm: RmsNorm::load(h, eps, vb.pp("post_attention_layernorm"))?,
            mlp: SwiGluMlp::new(h, config.intermediate_size, vb.pp("mlp"))?,
        })
    }

    /// Name of the attention layer's cache pool.
    pub fn attention_layer_name(&self) -> &str {
        self.self_attn.layer_name()
    }

    /// Pre-norm layer step. Returns `(output, residual)`.
    ///
    /// `residual` is `None` on the first layer, where `hidden_states` itself
    /// becomes the residual stream.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        residual: Option<&Tensor>,
        batch: &DraftBatch<'_>,
        kv_cache: Option<&mut DraftKvCache>,
    ) -> Result<(Tensor, Tensor)> {
        let (normed, residual) = match (residual, &self.input_layernorm) {
            (None, None) => (hidden_states.clone(), hidden_states.clone()),
            (None, Some(norm)) => (norm.forward(hidden_states)?, hidden_states.clone()),
            (Some(residual), Some(norm)) => norm.forward_residual(hidden_states, residual)?,
            (Some(residual), None) => {
                let summed = (hidden_states + residual)?;
                (summed.clone(), summed)
            }
        };

        let attn_output = self.self_attn.forward(&normed, batch, kv_cache)?;
        self.feed_forward(&attn_output, &residual)
    }

    /// EAGLE-3 midlayer step over token embeddings and target features.
    /// Returns `(output, residual)`.
    pub fn forward_midlayer(
        &self,
        embeds: &Tensor,
        hidden_states: &Tensor,
        batch: &DraftBatch<'_>,
        kv_cache: Option<&mut DraftKvCache>,
    ) -> Result<(Tensor, Tensor)> {
        let embeds = match &self.input_layernorm {
            Some(norm) => norm.forward(embeds)?,
            None => embeds.clone(),
        };
        let features = match &self.hidden_norm {
            Some(norm) => norm.forward(hidden_states)?,
            None => hidden_states.clone(),
        };

        let x = Tensor::cat(&[&embeds, &features], 1)?;
        let attn_output = self.self_attn.forward(&x, batch, kv_cache)?;
        self.feed_forward(&attn_output, hidden_states)
    }

    fn feed_forward(&self, attn_output: &Tensor, residual: &Tensor) -> Result<(Tensor, Tensor)> {
        let (normed, residual) = self
            .post_attention_layernorm
            .forward_residual(attn_output, residual)?;
        Ok((self.mlp.forward(&normed)?, residual))
    }
}
