//! Token selection for the draft loop.

pub mod sampler;

pub use sampler::{DraftSampler, GreedySampler, Sampler, SamplingMetadata};
