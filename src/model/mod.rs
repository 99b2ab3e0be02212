//! Model implementations.
//!
//! This module contains:
//! - Llama-style building blocks (RMSNorm, RoPE, paged GQA, SwiGLU)
//! - EAGLE and EAGLE-3 draft heads
//! - Checkpoint loading from local directories or HuggingFace

pub mod attention;
pub mod decoder;
pub mod eagle;
pub mod loader;
pub mod mlp;
pub mod norm;
pub mod rope;
pub mod weight;

pub use eagle::EagleDraftModel;
pub use loader::{
    download_model, load_config, load_safetensors, ModelFiles, SafetensorsModelProvider,
    TargetWeights,
};
pub use weight::Weight;
