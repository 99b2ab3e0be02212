//! Draft model loading.
//!
//! Builds the draft head, records which attention layers it added on top of
//! the target, and decides which of its weights alias the target's.
//!
//! ## Weight sharing
//!
//! | weight        | shared when                                          |
//! |---------------|------------------------------------------------------|
//! | embed_tokens  | single pipeline stage and identical shape            |
//! | lm_head       | the method predicts in the target vocabulary (EAGLE) |
//!
//! Shared weights are [`Weight::Shared`] handles to the target's own
//! tensors, never copies.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use super::config::{MethodStrategy, SpeculativeConfig};
use super::interfaces::{
    DraftModel, LayerKind, LayerRegistry, ModelProvider, PipelineGroup, TargetModel,
};
use crate::error::{Error, Result};
use crate::model::Weight;

/// A draft head ready to drive, plus what the cache allocator needs to know.
pub struct LoadedDraft {
    /// The draft network.
    pub model: Box<dyn DraftModel>,
    /// Attention layers registered by the draft and not by the target.
    pub attn_layer_names: Vec<String>,
    /// Behaviour switches of the configured method.
    pub strategy: MethodStrategy,
}

impl std::fmt::Debug for LoadedDraft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedDraft")
            .field("attn_layer_names", &self.attn_layer_names)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// Loads draft heads through injected collaborators.
pub struct DraftLoader<'a> {
    provider: &'a dyn ModelProvider,
    registry: &'a dyn LayerRegistry,
    pipeline: &'a dyn PipelineGroup,
}

impl<'a> DraftLoader<'a> {
    /// Create a loader.
    pub fn new(
        provider: &'a dyn ModelProvider,
        registry: &'a dyn LayerRegistry,
        pipeline: &'a dyn PipelineGroup,
    ) -> Self {
        Self {
            provider,
            registry,
            pipeline,
        }
    }

    /// Build the draft head for `target`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for an invalid speculative config
    /// - [`Error::Integrity`] when the draft does not register every target
    ///   attention layer plus at least one of its own
    /// - whatever the provider reports while building the model
    pub fn load(&self, config: &SpeculativeConfig, target: &dyn TargetModel) -> Result<LoadedDraft> {
        config.validate()?;
        let strategy = config.strategy();

        let mut draft_config = self.provider.draft_config(config)?;
        if draft_config.layer_offset == 0 {
            draft_config.layer_offset = target.config().num_hidden_layers;
        }

        let target_layers = self
            .registry
            .layers_of(target.config(), LayerKind::Attention)?;
        let mut model = self.provider.build_model(config, &draft_config)?;
        let all_layers = self
            .registry
            .layers_of(&draft_config, LayerKind::Attention)?;

        let attn_layer_names = draft_only_layers(&target_layers, &all_layers)?;
        debug!(layers = ?attn_layer_names, "Draft attention layers");

        let target_embed = target.embed_tokens();
        if self.pipeline.world_size() == 1 && model.embed_tokens().dims() == target_embed.dims() {
            model.set_embed_tokens(Weight::Shared(Arc::clone(target_embed)));
            info!("Draft shares the target embedding table");
        } else {
            info!(
                pipeline_parallel_size = self.pipeline.world_size(),
                draft_shape = ?model.embed_tokens().dims(),
                target_shape = ?target_embed.dims(),
                "Draft keeps its own embedding table"
            );
        }

        if strategy.shares_lm_head {
            model.set_lm_head(Weight::Shared(Arc::clone(target.lm_head())));
            info!("Draft shares the target LM head");
        }

        info!(
            method = %config.method,
            num_speculative_tokens = config.num_speculative_tokens,
            num_draft_layers = attn_layer_names.len(),
            "Loaded draft model"
        );

        Ok(LoadedDraft {
            model,
            attn_layer_names,
            strategy,
        })
    }
}

/// Layers in `all` but not in `target`, which must be a subset of `all`.
fn draft_only_layers(target: &BTreeSet<String>, all: &BTreeSet<String>) -> Result<Vec<String>> {
    if let Some(missing) = target.difference(all).next() {
        return Err(Error::Integrity(format!(
            "target attention layer {missing} is not visible after loading the draft"
        )));
    }
    let extra: Vec<String> = all.difference(target).cloned().collect();
    if extra.is_empty() {
        return Err(Error::Integrity(
            "draft model registered no attention layers of its own".into(),
        ));
    }
    Ok(extra)
}
