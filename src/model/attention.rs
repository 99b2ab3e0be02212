//! Paged attention over a variable-length drafting batch.
//!
//! Every request contributes `query_len` fresh rows and may already hold
//! `seq_len - query_len` cached positions in the draft KV cache. Fresh K/V
//! are written to their slots first, then each request attends over
//! `[cached context, fresh rows]` with a causal mask inside the fresh rows.
//!
//! ```text
//! request i:   cached (block table)          fresh rows
//!              [k0 k1 ... k(c-1)]            [q0 q1 q2]
//!                                             q0 sees k0..k(c-1), q0
//!                                             q2 sees everything
//! ```

use candle_core::{Device, Module, Tensor, D};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use super::rope::RotaryEmbedding;
use crate::config::ModelConfig;
use crate::core::kv_cache::DraftKvCache;
use crate::error::{Error, Result};
use crate::speculative::interfaces::DraftBatch;

/// Grouped query attention reading context from a paged cache.
#[derive(Debug, Clone)]
pub struct PagedAttention {
    /// Query projection [input_size] -> [num_heads * head_dim].
    q_proj: Linear,
    /// Key projection [input_size] -> [num_kv_heads * head_dim].
    k_proj: Linear,
    /// Value projection [input_size] -> [num_kv_heads * head_dim].
    v_proj: Linear,
    /// Output projection [num_heads * head_dim] -> [hidden_size].
    o_proj: Linear,
    rotary_emb: RotaryEmbedding,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
    /// Name of the cache pool this layer owns.
    layer_name: String,
}

impl PagedAttention {
    /// Loads the projections under `vb`.
    ///
    /// `input_size` is the width of the rows fed to the Q/K/V projections,
    /// which differs from `hidden_size` when the layer reads concatenated
    /// features.
    pub fn new(
        config: &ModelConfig,
        input_size: usize,
        layer_name: impl Into<String>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads;
        let head_dim = config.head_dim();

        let q_proj = linear_no_bias(input_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(input_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(input_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, config.hidden_size, vb.pp("o_proj"))?;

        let rotary_emb = RotaryEmbedding::new(
            head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            vb.dtype(),
            vb.device(),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rotary_emb,
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
            layer_name: layer_name.into(),
        })
    }

    /// Name of the KV cache pool this layer reads and writes.
    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    /// Attend over `x` `[num_rows, input_size]`, returning `[num_rows, hidden_size]`.
    ///
    /// Without a cache nothing is written, and every request must be
    /// entirely contained in this pass (`seq_len == query_len`).
    pub fn forward(
        &self,
        x: &Tensor,
        batch: &DraftBatch<'_>,
        mut kv_cache: Option<&mut DraftKvCache>,
    ) -> Result<Tensor> {
        let num_rows = x.dim(0)?;
        if batch.num_rows() != num_rows {
            return Err(Error::shape("attention rows", num_rows, batch.num_rows()));
        }
        if batch.query_start_loc.len() != batch.batch_size() + 1 {
            return Err(Error::shape(
                "query_start_loc",
                batch.batch_size() + 1,
                batch.query_start_loc.len(),
            ));
        }

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let q = q.reshape((num_rows, self.num_heads, self.head_dim))?;
        let k = k.reshape((num_rows, self.num_kv_heads, self.head_dim))?;
        let v = v.reshape((num_rows, self.num_kv_heads, self.head_dim))?;

        let (q, k) = self.rotary_emb.apply(&q, &k, batch.positions)?;

        if let Some(cache) = kv_cache.as_deref_mut() {
            cache
                .layer_mut(&self.layer_name)?
                .write(&k, &v, batch.slot_mapping)?;
        }

        let mut outputs = Vec::with_capacity(batch.batch_size());
        for (i, bounds) in batch.query_start_loc.windows(2).enumerate() {
            let (start, end) = (bounds[0], bounds[1]);
            let query_len = end.checked_sub(start).ok_or_else(|| {
                Error::Precondition(format!("query_start_loc decreases at request {i}"))
            })?;
            if query_len == 0 {
                continue;
            }
            let cached_len = batch.seq_lens[i].checked_sub(query_len).ok_or_else(|| {
                Error::Precondition(format!(
                    "request {i} has seq_len {} shorter than its {query_len} rows",
                    batch.seq_lens[i]
                ))
            })?;

            let mut keys = k.narrow(0, start, query_len)?;
            let mut values = v.narrow(0, start, query_len)?;
            if cached_len > 0 {
                let (cached_k, cached_v) =
                    self.cached_context(kv_cache.as_deref(), batch, i, cached_len)?;
                keys = Tensor::cat(&[&cached_k.to_dtype(keys.dtype())?, &keys], 0)?;
                values = Tensor::cat(&[&cached_v.to_dtype(values.dtype())?, &values], 0)?;
            }

            let query = q.narrow(0, start, query_len)?;
            outputs.push(self.attend(&query, &keys, &values, cached_len)?);
        }

        let attn_output = if outputs.is_empty() {
            Tensor::zeros((0, self.num_heads * self.head_dim), x.dtype(), x.device())?
        } else {
            Tensor::cat(&outputs, 0)?
        };
        Ok(self.o_proj.forward(&attn_output)?)
    }

    /// K/V of the first `cached_len` positions of request `i`.
    fn cached_context(
        &self,
        kv_cache: Option<&DraftKvCache>,
        batch: &DraftBatch<'_>,
        i: usize,
        cached_len: usize,
    ) -> Result<(Tensor, Tensor)> {
        let layer = kv_cache
            .and_then(|cache| cache.layer(&self.layer_name))
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "request {i} needs {cached_len} cached positions but layer {} has no KV cache",
                    self.layer_name
                ))
            })?;
        let block_table = batch
            .block_tables
            .get(i)
            .ok_or_else(|| Error::shape("block_tables", batch.batch_size(), batch.block_tables.len()))?;
        let slots = block_table.context_slots(cached_len)?;
        layer.gather(&slots)
    }

    /// Scaled dot-product attention for one request.
    ///
    /// `query` is `[L, num_heads, head_dim]`, `keys`/`values` are
    /// `[cached_len + L, num_kv_heads, head_dim]`.
    fn attend(
        &self,
        query: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        cached_len: usize,
    ) -> candle_core::Result<Tensor> {
        let query_len = query.dim(0)?;
        let context_len = keys.dim(0)?;

        let keys = self.repeat_kv(keys)?;
        let values = self.repeat_kv(values)?;

        // [num_heads, len, head_dim]
        let query = query.transpose(0, 1)?.contiguous()?;
        let keys = keys.transpose(0, 1)?.contiguous()?;
        let values = values.transpose(0, 1)?.contiguous()?;

        let scores = (query.matmul(&keys.transpose(D::Minus2, D::Minus1)?)? * self.scale)?;
        let scores = if query_len > 1 {
            let mask = causal_mask(query_len, context_len, cached_len, query.device())?;
            scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?
        } else {
            scores
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        probs
            .matmul(&values)?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((query_len, self.num_heads * self.head_dim))
    }

    /// `[len, num_kv_heads, head_dim]` -> `[len, num_heads, head_dim]`
    fn repeat_kv(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let n_rep = self.num_heads / self.num_kv_heads;
        if n_rep == 1 {
            return Ok(x.clone());
        }
        let (len, num_kv_heads, head_dim) = x.dims3()?;
        x.unsqueeze(2)?
            .expand((len, num_kv_heads, n_rep, head_dim))?
            .reshape((len, self.num_heads, head_dim))
    }
}

/// Query row `j` sits at context index `cached_len + j` and sees keys up to it.
fn causal_mask(
    query_len: usize,
    context_len: usize,
    cached_len: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let mask: Vec<f32> = (0..query_len)
        .flat_map(|j| {
            (0..context_len).map(move |c| {
                if c > cached_len + j {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (1, query_len, context_len), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::{BlockTable, PADDING_SLOT_ID};
    use crate::core::kv_cache::KvCacheSpec;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn tiny_config() -> ModelConfig {
        serde_json::from_str(
            r#"{"vocab_size": 16, "hidden_size": 8, "intermediate_size": 16,
                "num_hidden_layers": 1, "num_attention_heads": 2,
                "num_key_value_heads": 1, "max_position_embeddings": 64}"#,
        )
        .unwrap()
    }

    fn attention() -> PagedAttention {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        PagedAttention::new(&tiny_config(), 8, "model.layers.1.self_attn", vb).unwrap()
    }

    #[test]
    fn test_causal_mask_offsets_by_cached_len() {
        let mask = causal_mask(2, 4, 2, &Device::Cpu).unwrap();
        let mask = mask.squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(mask[0][..3], [0.0, 0.0, 0.0]);
        assert!(mask[0][3].is_infinite());
        assert_eq!(mask[1], vec![0.0; 4]);
    }

    #[test]
    fn test_forward_without_cache() {
        let attn = attention();
        let x = Tensor::randn(0f32, 1.0, (5, 8), &Device::Cpu).unwrap();
        let ids = Tensor::zeros(5, DType::U32, &Device::Cpu).unwrap();
        let tables = vec![BlockTable::default(), BlockTable::default()];
        let batch = DraftBatch {
            input_ids: &ids,
            positions: &[0, 1, 2, 0, 1],
            hidden_states: &x,
            slot_mapping: &[PADDING_SLOT_ID; 5],
            query_start_loc: &[0, 3, 5],
            seq_lens: &[3, 2],
            block_tables: &tables,
        };

        let out = attn.forward(&x, &batch, None).unwrap();
        assert_eq!(out.dims(), &[5, 8]);
    }

    #[test]
    fn test_cached_context_required() {
        let attn = attention();
        let x = Tensor::randn(0f32, 1.0, (1, 8), &Device::Cpu).unwrap();
        let ids = Tensor::zeros(1, DType::U32, &Device::Cpu).unwrap();
        let tables = vec![BlockTable::from_block_ids(4, vec![0])];
        let batch = DraftBatch {
            input_ids: &ids,
            positions: &[2],
            hidden_states: &x,
            slot_mapping: &[2],
            query_start_loc: &[0, 1],
            seq_lens: &[3],
            block_tables: &tables,
        };
        assert!(matches!(
            attn.forward(&x, &batch, None),
            Err(Error::Precondition(_))
        ));

        let spec = KvCacheSpec::new(2, 4, 1, 4);
        let mut cache =
            DraftKvCache::new(&["model.layers.1.self_attn"], spec, &Device::Cpu).unwrap();
        let out = attn.forward(&x, &batch, Some(&mut cache)).unwrap();
        assert_eq!(out.dims(), &[1, 8]);
    }

    #[test]
    fn test_decode_matches_prefill() {
        let attn = attention();
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (3, 8), &device).unwrap();
        let ids = Tensor::zeros(3, DType::U32, &device).unwrap();
        let tables = vec![BlockTable::from_block_ids(4, vec![1])];
        let spec = KvCacheSpec::new(2, 4, 1, 4);

        // all three rows in one pass
        let mut cache = DraftKvCache::new(&[attn.layer_name()], spec.clone(), &device).unwrap();
        let prefill = DraftBatch {
            input_ids: &ids,
            positions: &[0, 1, 2],
            hidden_states: &x,
            slot_mapping: &[4, 5, 6],
            query_start_loc: &[0, 3],
            seq_lens: &[3],
            block_tables: &tables,
        };
        let full = attn.forward(&x, &prefill, Some(&mut cache)).unwrap();

        // two rows, then the last row against the cache
        let mut cache = DraftKvCache::new(&[attn.layer_name()], spec, &device).unwrap();
        let head = x.narrow(0, 0, 2).unwrap();
        let ids_head = ids.narrow(0, 0, 2).unwrap();
        let first = DraftBatch {
            input_ids: &ids_head,
            positions: &[0, 1],
            hidden_states: &head,
            slot_mapping: &[4, 5],
            query_start_loc: &[0, 2],
            seq_lens: &[2],
            block_tables: &tables,
        };
        attn.forward(&head, &first, Some(&mut cache)).unwrap();
        let tail = x.narrow(0, 2, 1).unwrap();
        let ids_tail = ids.narrow(0, 2, 1).unwrap();
        let second = DraftBatch {
            input_ids: &ids_tail,
            positions: &[2],
            hidden_states: &tail,
            slot_mapping: &[6],
            query_start_loc: &[0, 1],
            seq_lens: &[3],
            block_tables: &tables,
        };
        let last = attn.forward(&tail, &second, Some(&mut cache)).unwrap();

        let expected = full.narrow(0, 2, 1).unwrap().to_vec2::<f32>().unwrap();
        let actual = last.to_vec2::<f32>().unwrap();
        for (a, e) in actual[0].iter().zip(&expected[0]) {
            assert!((a - e).abs() < 1e-4);
        }
    }
}
