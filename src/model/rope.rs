//! Rotary Position Embeddings (RoPE).
//!
//! Rows of a drafting batch belong to different requests, so positions are
//! given per row instead of as one start offset.
//!
//! Reference: <https://arxiv.org/abs/2104.09864>

use candle_core::{DType, Device, Result, Tensor};

/// Rotary Position Embedding with precomputed tables.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Precomputed cosine values [max_seq_len, head_dim].
    cos_cache: Tensor,
    /// Precomputed sine values [max_seq_len, head_dim].
    sin_cache: Tensor,
    /// Number of positions covered by the tables.
    max_seq_len: usize,
}

impl RotaryEmbedding {
    /// Precompute cos/sin tables for `max_seq_len` positions.
    ///
    /// `dim` must be even.
    pub fn new(
        dim: usize,
        max_seq_len: usize,
        theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if dim % 2 != 0 {
            candle_core::bail!("RoPE dimension must be even, got {dim}");
        }

        let half_dim = dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::new(positions.as_slice(), device)?.reshape((max_seq_len, 1))?;

        // [max_seq_len, dim/2] duplicated to [max_seq_len, dim]
        let freqs = positions.broadcast_mul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;

        Ok(Self {
            cos_cache: freqs.cos()?.to_dtype(dtype)?,
            sin_cache: freqs.sin()?.to_dtype(dtype)?,
            max_seq_len,
        })
    }

    /// Rotate `q` `[n, num_heads, head_dim]` and `k` `[n, num_kv_heads, head_dim]`
    /// by the position of each row.
    pub fn apply(&self, q: &Tensor, k: &Tensor, positions: &[usize]) -> Result<(Tensor, Tensor)> {
        if let Some(&bad) = positions.iter().find(|&&p| p >= self.max_seq_len) {
            candle_core::bail!("position {bad} beyond RoPE table of {}", self.max_seq_len);
        }
        let index: Vec<u32> = positions.iter().map(|&p| p as u32).collect();
        let index = Tensor::new(index.as_slice(), q.device())?;

        // [n, 1, dim] broadcasts over heads
        let cos = self.cos_cache.index_select(&index, 0)?.unsqueeze(1)?;
        let sin = self.sin_cache.index_select(&index, 0)?.unsqueeze(1)?;

        Ok((rotate(q, &cos, &sin)?, rotate(k, &cos, &sin)?))
    }
}

/// `x * cos + rotate_half(x) * sin`
fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let last = x.rank() - 1;
    let half = x.dim(last)? / 2;
    let x1 = x.narrow(last, 0, half)?;
    let x2 = x.narrow(last, half, half)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], last)?;
    x.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?
}
