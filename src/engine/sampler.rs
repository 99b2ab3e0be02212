//! Token sampling policies for drafting.
//!
//! The draft loop derives one token per request per step from the draft
//! head's logits. Which distribution it draws from is a policy decision, so
//! the loop talks to a [`DraftSampler`] and ships two policies:
//!
//! - [`GreedySampler`]: arg-max, stays on the device
//! - [`Sampler`]: temperature / top-k / top-p with a seeded RNG
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling
//! Logits / temperature
//!     │
//!     ▼ Top-k filtering (optional)
//! Keep top k tokens
//!     │
//!     ▼ Softmax
//! Probabilities
//!     │
//!     ▼ Top-p filtering (optional)
//! Cumulative prob ≤ p
//!     │
//!     ▼ Renormalize + Sample
//! Selected token
//! ```

use candle_core::{DType, IndexOp, Tensor, D};
use rand::distributions::Distribution;
use rand::SeedableRng;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Per-request sampling parameters for one drafting call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingMetadata {
    /// One entry per request, in batch order.
    pub per_request: Vec<SamplingConfig>,
}

impl SamplingMetadata {
    /// Arg-max for every request.
    pub fn greedy(batch_size: usize) -> Self {
        Self {
            per_request: vec![SamplingConfig::greedy(); batch_size],
        }
    }

    /// Same parameters for every request.
    pub fn uniform(config: SamplingConfig, batch_size: usize) -> Self {
        Self {
            per_request: vec![config; batch_size],
        }
    }

    /// Number of requests described.
    pub fn len(&self) -> usize {
        self.per_request.len()
    }

    /// Whether no request is described.
    pub fn is_empty(&self) -> bool {
        self.per_request.is_empty()
    }

    /// Whether every request samples by arg-max.
    pub fn all_greedy(&self) -> bool {
        self.per_request.iter().all(SamplingConfig::is_greedy)
    }
}

/// Derives one token per row of a `[batch, vocab]` logits tensor.
pub trait DraftSampler: Send {
    /// Returns a `[batch]` `u32` tensor on the logits' device.
    fn sample(&mut self, logits: &Tensor, metadata: &SamplingMetadata) -> Result<Tensor>;
}

/// Arg-max over the vocabulary.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySampler;

impl GreedySampler {
    /// Arg-max of each row, kept on the device.
    pub fn argmax(logits: &Tensor) -> Result<Tensor> {
        Ok(logits.argmax(D::Minus1)?.to_dtype(DType::U32)?)
    }
}

impl DraftSampler for GreedySampler {
    fn sample(&mut self, logits: &Tensor, _metadata: &SamplingMetadata) -> Result<Tensor> {
        Self::argmax(logits)
    }
}

/// Stochastic sampler honouring each request's [`SamplingConfig`].
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Random number generator.
    rng: rand::rngs::StdRng,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    /// Creates a sampler seeded from entropy.
    pub fn new() -> Self {
        Self {
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    /// Creates a sampler with a specific seed for reproducibility.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }

    /// Sample a single token from 1D logits.
    fn sample_single(&mut self, logits: &Tensor, config: &SamplingConfig) -> Result<u32> {
        if config.is_greedy() {
            return Ok(logits.argmax(D::Minus1)?.to_dtype(DType::U32)?.to_scalar::<u32>()?);
        }

        let vocab_size = logits.dim(0)?;
        let logits = (logits.to_dtype(DType::F32)? / config.temperature as f64)?;
        let values: Vec<f32> = logits.to_vec1()?;

        // (token, logit) pairs, optionally cut to the top k
        let mut candidates: Vec<(u32, f32)> = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i as u32, v))
            .collect();
        if config.top_k > 0 && config.top_k < vocab_size {
            candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            candidates.truncate(config.top_k);
        }

        // Softmax over the surviving candidates
        let max = candidates
            .iter()
            .map(|&(_, v)| v)
            .fold(f32::NEG_INFINITY, f32::max);
        let mut probs: Vec<(u32, f32)> = candidates
            .into_iter()
            .map(|(t, v)| (t, (v - max).exp()))
            .collect();
        let sum: f32 = probs.iter().map(|&(_, p)| p).sum();
        for entry in &mut probs {
            entry.1 /= sum;
        }

        if config.top_p > 0.0 && config.top_p < 1.0 {
            probs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            let mut cumulative = 0.0f32;
            let mut cutoff = probs.len();
            for (i, &(_, p)) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative > config.top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            probs.truncate(cutoff);
        }

        let weights: Vec<f64> = probs.iter().map(|&(_, p)| p as f64).collect();
        let dist = rand::distributions::WeightedIndex::new(&weights)
            .map_err(|e| Error::Precondition(format!("cannot sample from logits: {e}")))?;
        Ok(probs[dist.sample(&mut self.rng)].0)
    }
}

impl DraftSampler for Sampler {
    fn sample(&mut self, logits: &Tensor, metadata: &SamplingMetadata) -> Result<Tensor> {
        let batch_size = logits.dim(0)?;
        if metadata.len() != batch_size {
            return Err(Error::shape("sampling metadata", batch_size, metadata.len()));
        }

        let mut tokens = Vec::with_capacity(batch_size);
        for (i, config) in metadata.per_request.iter().enumerate() {
            tokens.push(self.sample_single(&logits.i(i)?, config)?);
        }
        Ok(Tensor::new(tokens, logits.device())?)
    }
}
