//! Paged KV cache plumbing used by the draft head.
//!
//! This module contains:
//! - BlockTable for mapping positions to physical slots
//! - DraftKvCache for the draft-only attention layers

pub mod block;
pub mod kv_cache;

pub use block::{BlockTable, DEFAULT_BLOCK_SIZE, PADDING_SLOT_ID};
pub use kv_cache::{DraftKvCache, KvCacheSpec, LayerKvCache};
