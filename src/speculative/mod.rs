//! EAGLE speculative drafting.
//!
//! A small draft head proposes `k` tokens per request; the target model
//! verifies them in one forward pass elsewhere in the engine.
//!
//! ## Cycle
//!
//! ```text
//! verification ──► num_rejected_tokens
//!                        │
//!                        ▼
//!                   remap()  ──► accepted rows per request
//!                        │
//!                        ▼
//! next_token_ids ─► EagleProposer::propose() ──► draft tokens [batch, k]
//!                        │                            │
//!                        ▼                            ▼
//!                paged draft KV cache            verification
//! ```
//!
//! The draft head itself is built once per session by [`DraftLoader`],
//! which also decides which weights alias the target model's.

pub mod config;
pub mod interfaces;
pub mod loader;
pub mod proposer;
pub mod remap;

pub use config::{DraftMethod, MethodStrategy, OutputRepresentation, SpeculativeConfig, TokenResidency};
pub use interfaces::{
    ConfigLayerRegistry, DraftBatch, DraftModel, DraftOutput, LayerKind, LayerRegistry,
    ModelProvider, PipelineGroup, TargetModel,
};
pub use loader::{DraftLoader, LoadedDraft};
pub use proposer::{EagleProposer, ProposeInput};
pub use remap::{remap, select_accepted, select_accepted_host, AcceptedIndexMap};
