//! nano-eagle: EAGLE speculative drafting in Rust.
//!
//! This crate implements the draft side of speculative decoding:
//! - Batch index remapping after partial rejection
//! - Draft model loading with weight sharing against the target model
//! - A multi-step draft loop over a paged KV cache

pub mod config;
pub mod error;
pub mod logging;

pub mod core;
pub mod engine;
pub mod model;
pub mod speculative;

pub use config::{ModelConfig, ParallelConfig, SamplingConfig};
pub use engine::{DraftSampler, GreedySampler, Sampler, SamplingMetadata};
pub use error::{Error, Result};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use model::{EagleDraftModel, ModelFiles, SafetensorsModelProvider, TargetWeights, Weight};
pub use speculative::{
    remap, AcceptedIndexMap, DraftLoader, DraftMethod, EagleProposer, LoadedDraft, ProposeInput,
    SpeculativeConfig, TokenResidency,
};
