//! EAGLE and EAGLE-3 draft heads.
//!
//! Both heads predict the next token from the current token embedding and
//! a feature vector taken from the target model (or from the previous
//! drafting step).
//!
//! ## Architecture
//!
//! ```text
//! EAGLE                                 EAGLE-3
//! ─────                                 ───────
//! ids ─► embed ─┐                       target aux features [3 * h_t]
//! features ─────┴─ cat ─► fc (2h→h)           │ fc (combine, 3h_t→h)
//!                   │                          ▼
//!                   ▼                   ids ─► embed ─┐
//!              decoder layers ×N        features ─────┴─► midlayer
//!                   │                                      │
//!                   ▼                                      ▼ norm
//!         target LM head (shared)          own LM head [draft_vocab]
//!                                                          │ d2t
//!                                                          ▼
//!                                            logits in target vocab
//! ```

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear_no_bias, Init, Linear, VarBuilder, VarMap};
use tracing::debug;

use super::decoder::EagleDecoderLayer;
use super::norm::RmsNorm;
use super::weight::Weight;
use crate::config::ModelConfig;
use crate::core::kv_cache::DraftKvCache;
use crate::error::{Error, Result};
use crate::speculative::config::DraftMethod;
use crate::speculative::interfaces::{ConfigLayerRegistry, DraftBatch, DraftModel, DraftOutput};

/// Method-specific layers.
#[derive(Debug, Clone)]
enum Architecture {
    Eagle {
        layers: Vec<EagleDecoderLayer>,
    },
    Eagle3 {
        midlayer: EagleDecoderLayer,
        norm: RmsNorm,
        /// For each target id, its column in the padded draft logits.
        /// Unmapped ids point at the trailing `-inf` column.
        vocab_map: Tensor,
    },
}

/// A draft head loaded from an EAGLE or EAGLE-3 checkpoint.
#[derive(Debug, Clone)]
pub struct EagleDraftModel {
    method: DraftMethod,
    embed_tokens: Weight,
    /// Feature fusion (EAGLE) or auxiliary-state combiner (EAGLE-3).
    fc: Linear,
    architecture: Architecture,
    lm_head: Weight,
    hidden_size: usize,
    vocab_size: usize,
}

impl EagleDraftModel {
    /// Builds the head from checkpoint tensors under `vb`.
    ///
    /// Attention layers are named after their global index, starting at
    /// `config.layer_offset`. An EAGLE checkpoint without `lm_head.weight`
    /// starts with its embedding table as output projection until the
    /// loader points it at the target's head.
    pub fn new(config: &ModelConfig, method: DraftMethod, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let h = config.hidden_size;
        let vocab_size = config.vocab_size;

        let embed_tokens = vb.get((vocab_size, h), "embed_tokens.weight")?;

        let (fc, architecture, lm_head) = match method {
            DraftMethod::Eagle => {
                let fc = linear_no_bias(2 * h, h, vb.pp("fc"))?;
                let layers = (0..config.num_hidden_layers)
                    .map(|i| {
                        EagleDecoderLayer::new_eagle(
                            config,
                            i,
                            ConfigLayerRegistry::attention_layer_name(config.layer_offset + i),
                            vb.pp(format!("layers.{i}")),
                        )
                    })
                    .collect::<Result<Vec<_>>>()?;
                let lm_head = if vb.contains_tensor("lm_head.weight") {
                    vb.get((vocab_size, h), "lm_head.weight")?
                } else {
                    embed_tokens.clone()
                };
                (fc, Architecture::Eagle { layers }, lm_head)
            }
            DraftMethod::Eagle3 => {
                if config.num_hidden_layers != 1 {
                    return Err(Error::Config(format!(
                        "EAGLE-3 heads have exactly one decoder layer, config declares {}",
                        config.num_hidden_layers
                    )));
                }
                let draft_vocab = config.draft_vocab_size();
                let fc = linear_no_bias(3 * config.target_hidden_size(), h, vb.pp("fc"))?;
                let midlayer = EagleDecoderLayer::new_eagle3(
                    config,
                    ConfigLayerRegistry::attention_layer_name(config.layer_offset),
                    vb.pp("midlayer"),
                )?;
                let norm = RmsNorm::load(h, config.rms_norm_eps, vb.pp("norm"))?;
                let lm_head = vb.get((draft_vocab, h), "lm_head.weight")?;
                let d2t = vb
                    .get_with_hints_dtype(draft_vocab, "d2t", Init::Const(0.0), DType::I64)?
                    .to_vec1::<i64>()?;
                let vocab_map = build_vocab_map(&d2t, vocab_size, vb.device())?;
                (
                    fc,
                    Architecture::Eagle3 {
                        midlayer,
                        norm,
                        vocab_map,
                    },
                    lm_head,
                )
            }
        };

        debug!(
            method = %method,
            hidden_size = h,
            vocab_size,
            "Built draft head"
        );

        Ok(Self {
            method,
            embed_tokens: Weight::Owned(embed_tokens),
            fc,
            architecture,
            lm_head: Weight::Owned(lm_head),
            hidden_size: h,
            vocab_size,
        })
    }

    /// Creates a head with random weights for testing.
    pub fn new_random(
        config: &ModelConfig,
        method: DraftMethod,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        Self::new(config, method, VarBuilder::from_varmap(&varmap, dtype, device))
    }

    /// Drafting method this head implements.
    pub fn method(&self) -> DraftMethod {
        self.method
    }

    /// Target vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Names of the attention layers, in layer order.
    pub fn attention_layer_names(&self) -> Vec<String> {
        match &self.architecture {
            Architecture::Eagle { layers } => layers
                .iter()
                .map(|l| l.attention_layer_name().to_string())
                .collect(),
            Architecture::Eagle3 { midlayer, .. } => {
                vec![midlayer.attention_layer_name().to_string()]
            }
        }
    }
}

/// Invert the `d2t` offset table: draft id `d` predicts target id `d + d2t[d]`.
fn build_vocab_map(d2t: &[i64], vocab_size: usize, device: &Device) -> Result<Tensor> {
    let unmapped = d2t.len() as u32;
    let mut map = vec![unmapped; vocab_size];
    for (draft_id, &offset) in d2t.iter().enumerate() {
        let target_id = draft_id as i64 + offset;
        let slot = usize::try_from(target_id)
            .ok()
            .and_then(|t| map.get_mut(t))
            .ok_or_else(|| {
                Error::Integrity(format!(
                    "draft id {draft_id} maps to target id {target_id} outside vocab of {vocab_size}"
                ))
            })?;
        *slot = draft_id as u32;
    }
    Ok(Tensor::new(map, device)?)
}

impl DraftModel for EagleDraftModel {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn embed_tokens(&self) -> &Weight {
        &self.embed_tokens
    }

    fn set_embed_tokens(&mut self, weight: Weight) {
        self.embed_tokens = weight;
    }

    fn lm_head(&self) -> &Weight {
        &self.lm_head
    }

    fn set_lm_head(&mut self, weight: Weight) {
        self.lm_head = weight;
    }

    fn combine_hidden_states(&self, hidden_states: &Tensor) -> Result<Tensor> {
        match self.architecture {
            Architecture::Eagle3 { .. } => Ok(self.fc.forward(hidden_states)?),
            Architecture::Eagle { .. } => Ok(hidden_states.clone()),
        }
    }

    fn forward(
        &mut self,
        batch: &DraftBatch<'_>,
        mut kv_cache: Option<&mut DraftKvCache>,
    ) -> Result<DraftOutput> {
        let embeds = self.embed_tokens.tensor().index_select(batch.input_ids, 0)?;
        let features = batch.hidden_states.to_dtype(embeds.dtype())?;

        match &self.architecture {
            Architecture::Eagle { layers } => {
                let mut hidden = self.fc.forward(&Tensor::cat(&[&embeds, &features], 1)?)?;
                let mut residual: Option<Tensor> = None;
                for layer in layers {
                    let (out, res) =
                        layer.forward(&hidden, residual.as_ref(), batch, kv_cache.as_deref_mut())?;
                    hidden = out;
                    residual = Some(res);
                }
                let hidden = match residual {
                    Some(residual) => (hidden + residual)?,
                    None => hidden,
                };
                Ok(DraftOutput {
                    last_hidden_states: hidden.clone(),
                    hidden_states: hidden,
                })
            }
            Architecture::Eagle3 { midlayer, norm, .. } => {
                let (hidden, residual) =
                    midlayer.forward_midlayer(&embeds, &features, batch, kv_cache)?;
                let (normed, prenorm) = norm.forward_residual(&hidden, &residual)?;
                Ok(DraftOutput {
                    last_hidden_states: normed,
                    hidden_states: prenorm,
                })
            }
        }
    }

    fn compute_logits(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let head = Linear::new(self.lm_head.tensor().clone(), None);
        let logits = head.forward(hidden_states)?;

        match &self.architecture {
            Architecture::Eagle { .. } => Ok(logits),
            Architecture::Eagle3 { vocab_map, .. } => {
                let rows = logits.dim(0)?;
                let pad = Tensor::full(f32::NEG_INFINITY, (rows, 1), logits.device())?
                    .to_dtype(logits.dtype())?;
                let padded = Tensor::cat(&[&logits, &pad], 1)?.contiguous()?;
                Ok(padded.index_select(vocab_map, 1)?)
            }
        }
    }
}
