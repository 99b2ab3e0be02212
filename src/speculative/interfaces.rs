//! Capabilities the drafter consumes from the rest of the engine.
//!
//! Model construction, the layer registry and the pipeline-parallel group
//! are injected as trait objects so tests and production can supply
//! different implementations.

use std::collections::BTreeSet;
use std::sync::Arc;

use candle_core::Tensor;

use super::config::SpeculativeConfig;
use crate::config::{ModelConfig, ParallelConfig};
use crate::core::block::BlockTable;
use crate::core::kv_cache::DraftKvCache;
use crate::error::Result;
use crate::model::Weight;

/// What the drafter needs to see of the target model.
pub trait TargetModel {
    /// Target model configuration.
    fn config(&self) -> &ModelConfig;

    /// Input embedding table `[vocab_size, hidden_size]`.
    fn embed_tokens(&self) -> &Arc<Tensor>;

    /// Output projection `[vocab_size, hidden_size]`. Tied models return
    /// the embedding table.
    fn lm_head(&self) -> &Arc<Tensor>;
}

/// One forward pass worth of draft inputs.
///
/// Rows of request `i` are `query_start_loc[i]..query_start_loc[i + 1]`.
#[derive(Debug, Clone, Copy)]
pub struct DraftBatch<'a> {
    /// Token ids `[num_rows]`, `u32`.
    pub input_ids: &'a Tensor,
    /// Position of each row.
    pub positions: &'a [usize],
    /// Target (or previous draft step) features `[num_rows, hidden]`.
    pub hidden_states: &'a Tensor,
    /// Cache slot per row; [`PADDING_SLOT_ID`](crate::core::block::PADDING_SLOT_ID) skips the write.
    pub slot_mapping: &'a [i64],
    /// Row offsets per request, `batch_size + 1` entries.
    pub query_start_loc: &'a [usize],
    /// Context length per request including this pass's rows.
    pub seq_lens: &'a [usize],
    /// Block table per request.
    pub block_tables: &'a [BlockTable],
}

impl DraftBatch<'_> {
    /// Number of requests.
    pub fn batch_size(&self) -> usize {
        self.seq_lens.len()
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.positions.len()
    }
}

/// Result of one draft forward pass.
#[derive(Debug, Clone)]
pub struct DraftOutput {
    /// Features used to compute logits, `[num_rows, hidden]`.
    pub last_hidden_states: Tensor,
    /// Features fed to the next drafting step, `[num_rows, hidden]`.
    pub hidden_states: Tensor,
}

/// A draft network the proposer can drive.
pub trait DraftModel: Send {
    /// Width of the features passed between steps.
    fn hidden_size(&self) -> usize;

    /// Input embedding table.
    fn embed_tokens(&self) -> &Weight;

    /// Replace the input embedding table.
    fn set_embed_tokens(&mut self, weight: Weight);

    /// Output projection.
    fn lm_head(&self) -> &Weight;

    /// Replace the output projection.
    fn set_lm_head(&mut self, weight: Weight);

    /// Project concatenated auxiliary target features down to `hidden_size`.
    fn combine_hidden_states(&self, hidden_states: &Tensor) -> Result<Tensor> {
        Ok(hidden_states.clone())
    }

    /// Run the draft network over a variable-length batch.
    fn forward(
        &mut self,
        batch: &DraftBatch<'_>,
        kv_cache: Option<&mut DraftKvCache>,
    ) -> Result<DraftOutput>;

    /// Next-token logits in the target vocabulary, `[rows, vocab_size]`.
    fn compute_logits(&self, hidden_states: &Tensor) -> Result<Tensor>;
}

/// Builds draft networks.
pub trait ModelProvider {
    /// Read the draft model's configuration.
    fn draft_config(&self, config: &SpeculativeConfig) -> Result<ModelConfig>;

    /// Construct the draft network with its own weights.
    fn build_model(
        &self,
        config: &SpeculativeConfig,
        draft_config: &ModelConfig,
    ) -> Result<Box<dyn DraftModel>>;
}

/// Kind of layer to look up in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum LayerKind {
    /// Attention layers, which need KV cache.
    Attention,
}

/// Names the layers each model registers.
pub trait LayerRegistry {
    /// All layers of `kind` visible under `config`.
    fn layers_of(&self, config: &ModelConfig, kind: LayerKind) -> Result<BTreeSet<String>>;
}

/// The pipeline-parallel process group.
pub trait PipelineGroup {
    /// Number of pipeline stages.
    fn world_size(&self) -> usize;
}

impl PipelineGroup for ParallelConfig {
    fn world_size(&self) -> usize {
        self.pipeline_parallel_size
    }
}

/// Registry deriving layer names from layer counts.
///
/// A model with `layer_offset = o` and `num_hidden_layers = n` sees the
/// attention layers `model.layers.{0..o + n}.self_attn`: its own plus every
/// layer registered before it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigLayerRegistry;

impl ConfigLayerRegistry {
    /// Name of the attention layer at a global index.
    pub fn attention_layer_name(index: usize) -> String {
        format!("model.layers.{index}.self_attn")
    }
}

impl LayerRegistry for ConfigLayerRegistry {
    fn layers_of(&self, config: &ModelConfig, kind: LayerKind) -> Result<BTreeSet<String>> {
        match kind {
            LayerKind::Attention => Ok((0..config.layer_offset + config.num_hidden_layers)
                .map(Self::attention_layer_name)
                .collect()),
        }
    }
}
