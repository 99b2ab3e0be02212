//! The draft loop.
//!
//! [`EagleProposer::propose`] runs the draft head for exactly `k` steps and
//! returns a `[batch_size, k]` token tensor.
//!
//! ## Step layout
//!
//! ```text
//! accepted rows (after remap)        step 0 rows
//! req 0: a0 a1 a2                    a0 a1 a2 b0      b0 = next_token_ids[0]
//! req 1: c0 c1                       c0 c1 b1
//!                                           ▲  ▲
//!                               last rows ──┴──┘ -> logits -> column 0
//!
//! steps 1..k: one row per request, position + 1, next block-table slot
//! ```
//!
//! With [`TokenResidency::Host`] every step's tokens are read back before
//! the next step is assembled. With [`TokenResidency::Device`] they stay on
//! the device and the loop never blocks on the host.

use candle_core::{DType, Device, Tensor};
use tracing::{debug, debug_span, trace};

use super::config::{MethodStrategy, SpeculativeConfig, TokenResidency};
use super::interfaces::{DraftBatch, DraftModel};
use super::loader::LoadedDraft;
use crate::core::block::{BlockTable, PADDING_SLOT_ID};
use crate::core::kv_cache::DraftKvCache;
use crate::engine::sampler::{DraftSampler, GreedySampler, Sampler, SamplingMetadata};
use crate::error::{Error, Result};

/// Inputs of one [`EagleProposer::propose`] call.
///
/// The per-token fields hold only the accepted tokens, grouped per request
/// by `cu_num_tokens` (see [`remap`](super::remap::remap)).
#[derive(Debug, Clone, Copy)]
pub struct ProposeInput<'a> {
    /// Accepted token ids `[num_tokens]`, `u32`.
    pub target_token_ids: &'a Tensor,
    /// Position of each accepted token.
    pub target_positions: &'a [usize],
    /// Target hidden states `[num_tokens, hidden]`, or the concatenated
    /// auxiliary states `[num_tokens, 3 * hidden]` for EAGLE-3.
    pub target_hidden_states: &'a Tensor,
    /// Cache slot of each accepted token.
    pub target_slot_mapping: &'a [i64],
    /// Bonus token per request `[batch_size]`, `u32`.
    pub next_token_ids: &'a Tensor,
    /// Prefix sums of accepted counts, `batch_size + 1` entries.
    pub cu_num_tokens: &'a [usize],
    /// Block table per request.
    pub block_tables: &'a [BlockTable],
    /// Sampling parameters per request.
    pub sampling_metadata: &'a SamplingMetadata,
}

/// Per-request decode state threaded through steps `1..k`.
#[derive(Debug, Clone, Default)]
struct DecodeState {
    /// True position of each request's current row.
    positions: Vec<usize>,
    /// Position fed to the model, clamped to 0 past `max_model_len`.
    input_positions: Vec<usize>,
    slot_mapping: Vec<i64>,
    seq_lens: Vec<usize>,
}

/// Drives a draft head to propose `k` tokens per request.
pub struct EagleProposer {
    model: Box<dyn DraftModel>,
    attn_layer_names: Vec<String>,
    strategy: MethodStrategy,
    num_speculative_tokens: usize,
    max_model_len: usize,
    token_residency: TokenResidency,
    sampler: Box<dyn DraftSampler>,
    kv_cache: Option<DraftKvCache>,
}

impl std::fmt::Debug for EagleProposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EagleProposer")
            .field("attn_layer_names", &self.attn_layer_names)
            .field("strategy", &self.strategy)
            .field("num_speculative_tokens", &self.num_speculative_tokens)
            .field("max_model_len", &self.max_model_len)
            .field("token_residency", &self.token_residency)
            .field("has_kv_cache", &self.kv_cache.is_some())
            .finish_non_exhaustive()
    }
}

impl EagleProposer {
    /// Create a proposer for a loaded draft head.
    ///
    /// Non-greedy requests are sampled with an entropy-seeded [`Sampler`]
    /// until [`with_sampler`](Self::with_sampler) installs another policy.
    pub fn new(loaded: LoadedDraft, config: &SpeculativeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model: loaded.model,
            attn_layer_names: loaded.attn_layer_names,
            strategy: loaded.strategy,
            num_speculative_tokens: config.num_speculative_tokens,
            max_model_len: config.max_model_len,
            token_residency: config.token_residency,
            sampler: Box::new(Sampler::new()),
            kv_cache: None,
        })
    }

    /// Replace the sampling policy used for non-greedy requests.
    pub fn with_sampler(mut self, sampler: Box<dyn DraftSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Attach the K/V pools of the draft-only layers.
    ///
    /// The cache must hold exactly one pool per name in
    /// [`attn_layer_names`](Self::attn_layer_names).
    pub fn bind_kv_cache(&mut self, kv_cache: DraftKvCache) -> Result<()> {
        if !kv_cache.covers_exactly(&self.attn_layer_names) {
            return Err(Error::Precondition(format!(
                "KV cache layers {:?} do not match draft layers {:?}",
                kv_cache.layer_names().collect::<Vec<_>>(),
                self.attn_layer_names
            )));
        }
        self.kv_cache = Some(kv_cache);
        Ok(())
    }

    /// The bound K/V pools, if any.
    pub fn kv_cache(&self) -> Option<&DraftKvCache> {
        self.kv_cache.as_ref()
    }

    /// Attention layers that need draft-only K/V pools.
    pub fn attn_layer_names(&self) -> &[String] {
        &self.attn_layer_names
    }

    /// Number of tokens proposed per request.
    pub fn num_speculative_tokens(&self) -> usize {
        self.num_speculative_tokens
    }

    /// The draft head.
    pub fn model(&self) -> &dyn DraftModel {
        self.model.as_ref()
    }

    /// Propose `k` tokens per request.
    ///
    /// Returns a `[batch_size, k]` `u32` tensor, one row per request in input
    /// order and columns in generation order. An empty batch returns zero
    /// rows without running the model.
    ///
    /// # Errors
    ///
    /// - [`Error::ShapeMismatch`] / [`Error::Precondition`] for inconsistent inputs
    /// - [`Error::CacheExhausted`] when a block table has no slot for the
    ///   next decode position
    pub fn propose(&mut self, input: &ProposeInput<'_>) -> Result<Tensor> {
        let k = self.num_speculative_tokens;
        let batch_size = validate_input(input)?;
        let device = input.target_hidden_states.device().clone();

        if batch_size == 0 {
            return Ok(Tensor::zeros((0, k), DType::U32, &device)?);
        }

        let span = debug_span!("propose", batch_size, k);
        let _enter = span.enter();

        let target_hidden = if self.strategy.combines_hidden_states {
            self.model.combine_hidden_states(input.target_hidden_states)?.contiguous()?
        } else {
            input.target_hidden_states.clone()
        };
        let hidden_width = target_hidden.dim(1)?;
        if hidden_width != self.model.hidden_size() {
            return Err(Error::shape(
                "target hidden width",
                self.model.hidden_size(),
                hidden_width,
            ));
        }

        // Step 0: accepted rows plus one bonus row per request.
        let prefill = build_prefill(input, self.max_model_len)?;
        let token_index = Tensor::new(prefill.token_index.as_slice(), &device)?;
        let hidden_index = Tensor::new(prefill.hidden_index.as_slice(), &device)?;
        let input_ids = Tensor::cat(&[input.target_token_ids, input.next_token_ids], 0)?
            .index_select(&token_index, 0)?;
        let hidden_rows = target_hidden.index_select(&hidden_index, 0)?;

        let batch = DraftBatch {
            input_ids: &input_ids,
            positions: &prefill.positions,
            hidden_states: &hidden_rows,
            slot_mapping: &prefill.slot_mapping,
            query_start_loc: &prefill.query_start_loc,
            seq_lens: &prefill.seq_lens,
            block_tables: input.block_tables,
        };
        let output = self.model.forward(&batch, self.kv_cache.as_mut())?;
        let num_rows = output.last_hidden_states.dim(0)?;
        if num_rows != prefill.positions.len() {
            return Err(Error::shape("draft output rows", prefill.positions.len(), num_rows));
        }

        let last_rows = Tensor::new(prefill.last_rows.as_slice(), &device)?;
        let logits = self
            .model
            .compute_logits(&output.last_hidden_states.index_select(&last_rows, 0)?)?;
        let mut tokens = self.derive_tokens(&logits, input.sampling_metadata)?;
        let mut hidden = output.hidden_states.index_select(&last_rows, 0)?;

        let mut columns = DraftColumns::new(self.token_residency, batch_size, k);
        let mut host_tokens = columns.push(&tokens, 0)?;

        // Steps 1..k: one row per request.
        let mut state = DecodeState {
            positions: prefill.bonus_positions,
            ..Default::default()
        };
        let query_start_loc: Vec<usize> = (0..=batch_size).collect();

        for step in 1..k {
            self.advance(&mut state, input.block_tables)?;

            if let Some(host) = host_tokens.take() {
                tokens = Tensor::new(host.as_slice(), &device)?;
            }
            let batch = DraftBatch {
                input_ids: &tokens,
                positions: &state.input_positions,
                hidden_states: &hidden,
                slot_mapping: &state.slot_mapping,
                query_start_loc: &query_start_loc,
                seq_lens: &state.seq_lens,
                block_tables: input.block_tables,
            };
            let output = self.model.forward(&batch, self.kv_cache.as_mut())?;
            let num_rows = output.last_hidden_states.dim(0)?;
            if num_rows != batch_size {
                return Err(Error::shape("draft output rows", batch_size, num_rows));
            }

            let logits = self.model.compute_logits(&output.last_hidden_states)?;
            tokens = self.derive_tokens(&logits, input.sampling_metadata)?;
            hidden = output.hidden_states;
            host_tokens = columns.push(&tokens, step)?;
        }

        debug!(batch_size, k, "Drafted tokens");
        columns.finish(&device)
    }

    /// Warm-up pass over `num_tokens` zero rows. Nothing is written to the
    /// cache.
    pub fn dummy_run(&mut self, num_tokens: usize) -> Result<()> {
        if num_tokens == 0 {
            return Ok(());
        }
        let embed = self.model.embed_tokens().tensor();
        let device = embed.device().clone();
        let dtype = embed.dtype();

        let input_ids = Tensor::zeros(num_tokens, DType::U32, &device)?;
        let hidden = Tensor::zeros((num_tokens, self.model.hidden_size()), dtype, &device)?;
        let positions = vec![0; num_tokens];
        let slot_mapping = vec![PADDING_SLOT_ID; num_tokens];
        let query_start_loc: Vec<usize> = (0..=num_tokens).collect();
        let seq_lens = vec![1; num_tokens];
        let block_tables = vec![BlockTable::default(); num_tokens];

        let batch = DraftBatch {
            input_ids: &input_ids,
            positions: &positions,
            hidden_states: &hidden,
            slot_mapping: &slot_mapping,
            query_start_loc: &query_start_loc,
            seq_lens: &seq_lens,
            block_tables: &block_tables,
        };
        self.model.forward(&batch, self.kv_cache.as_mut())?;
        debug!(num_tokens, "Draft warm-up pass");
        Ok(())
    }

    /// Move every request one position forward and pick its cache slot.
    fn advance(&self, state: &mut DecodeState, block_tables: &[BlockTable]) -> Result<()> {
        state.input_positions.clear();
        state.slot_mapping.clear();
        state.seq_lens.clear();

        for (request, (position, table)) in state
            .positions
            .iter_mut()
            .zip(block_tables)
            .enumerate()
        {
            *position += 1;
            if *position >= self.max_model_len {
                // Past the model length: attend to itself only and skip the write.
                state.input_positions.push(0);
                state.slot_mapping.push(PADDING_SLOT_ID);
                state.seq_lens.push(1);
                continue;
            }
            let slot = table
                .try_slot_for_position(*position)
                .ok_or(Error::CacheExhausted {
                    request,
                    position: *position,
                })?;
            state.input_positions.push(*position);
            state.slot_mapping.push(slot as i64);
            state.seq_lens.push(*position + 1);
        }
        Ok(())
    }

    /// One token per request, arg-max when every request is greedy.
    fn derive_tokens(&mut self, logits: &Tensor, metadata: &SamplingMetadata) -> Result<Tensor> {
        let tokens = if metadata.all_greedy() {
            GreedySampler::argmax(logits)?
        } else {
            self.sampler.sample(logits, metadata)?
        };
        Ok(tokens.to_dtype(DType::U32)?)
    }
}

/// Accumulates the output columns under the configured residency.
enum DraftColumns {
    Host { rows: Vec<Vec<u32>>, k: usize },
    Device { columns: Vec<Tensor> },
}

impl DraftColumns {
    fn new(residency: TokenResidency, batch_size: usize, k: usize) -> Self {
        match residency {
            TokenResidency::Host => DraftColumns::Host {
                rows: vec![Vec::with_capacity(k); batch_size],
                k,
            },
            TokenResidency::Device => DraftColumns::Device {
                columns: Vec::with_capacity(k),
            },
        }
    }

    /// Record column `step`. Under host residency this is the loop's
    /// synchronisation point and the host copy is returned for the next
    /// step's input.
    fn push(&mut self, tokens: &Tensor, step: usize) -> Result<Option<Vec<u32>>> {
        match self {
            DraftColumns::Host { rows, .. } => {
                let host = sync_tokens_to_host(tokens, step)?;
                for (row, &token) in rows.iter_mut().zip(&host) {
                    row.push(token);
                }
                Ok(Some(host))
            }
            DraftColumns::Device { columns } => {
                columns.push(tokens.clone());
                Ok(None)
            }
        }
    }

    fn finish(self, device: &Device) -> Result<Tensor> {
        match self {
            DraftColumns::Host { rows, k } => {
                let batch_size = rows.len();
                let flat: Vec<u32> = rows.into_iter().flatten().collect();
                Ok(Tensor::from_vec(flat, (batch_size, k), device)?)
            }
            DraftColumns::Device { columns } => Ok(Tensor::stack(&columns, 1)?),
        }
    }
}

/// Blocks until the sampled tokens are readable on the host.
fn sync_tokens_to_host(tokens: &Tensor, step: usize) -> Result<Vec<u32>> {
    trace!(step, "Synchronising draft tokens to host");
    Ok(tokens.to_vec1::<u32>()?)
}

/// Host-side layout of the step-0 batch.
#[derive(Debug, Clone, Default, PartialEq)]
struct PrefillLayout {
    /// Source of each row's id in `cat[target_token_ids, next_token_ids]`.
    token_index: Vec<u32>,
    /// Source of each row's features; bonus rows reuse the last accepted row.
    hidden_index: Vec<u32>,
    positions: Vec<usize>,
    slot_mapping: Vec<i64>,
    query_start_loc: Vec<usize>,
    seq_lens: Vec<usize>,
    /// Index of each request's bonus row.
    last_rows: Vec<u32>,
    /// True position of each request's bonus row, before clamping.
    bonus_positions: Vec<usize>,
}

/// Lay out step 0: each request's accepted rows followed by its bonus row.
fn build_prefill(input: &ProposeInput<'_>, max_model_len: usize) -> Result<PrefillLayout> {
    let batch_size = input.cu_num_tokens.len() - 1;
    let num_tokens = input.cu_num_tokens[batch_size];
    let num_rows = num_tokens + batch_size;

    let mut layout = PrefillLayout {
        token_index: Vec::with_capacity(num_rows),
        hidden_index: Vec::with_capacity(num_rows),
        positions: Vec::with_capacity(num_rows),
        slot_mapping: Vec::with_capacity(num_rows),
        query_start_loc: Vec::with_capacity(batch_size + 1),
        seq_lens: Vec::with_capacity(batch_size),
        last_rows: Vec::with_capacity(batch_size),
        bonus_positions: Vec::with_capacity(batch_size),
    };
    layout.query_start_loc.push(0);

    for (i, bounds) in input.cu_num_tokens.windows(2).enumerate() {
        let (start, end) = (bounds[0], bounds[1]);
        layout.token_index.extend((start..end).map(|r| r as u32));
        layout.hidden_index.extend((start..end).map(|r| r as u32));
        layout.positions.extend_from_slice(&input.target_positions[start..end]);
        layout
            .slot_mapping
            .extend_from_slice(&input.target_slot_mapping[start..end]);

        let bonus_position = input.target_positions[end - 1] + 1;
        let bonus_slot = if bonus_position >= max_model_len {
            PADDING_SLOT_ID
        } else {
            input.block_tables[i]
                .try_slot_for_position(bonus_position)
                .ok_or(Error::CacheExhausted {
                    request: i,
                    position: bonus_position,
                })? as i64
        };

        layout.token_index.push((num_tokens + i) as u32);
        layout.hidden_index.push((end - 1) as u32);
        // Past the model length the row is fed position 0, as in decode steps.
        layout.positions.push(if bonus_position >= max_model_len {
            0
        } else {
            bonus_position
        });
        layout.slot_mapping.push(bonus_slot);
        layout.last_rows.push((layout.positions.len() - 1) as u32);
        layout.query_start_loc.push(layout.positions.len());
        layout.seq_lens.push(bonus_position + 1);
        layout.bonus_positions.push(bonus_position);
    }
    Ok(layout)
}

/// Check the call-boundary contract, returning the batch size.
fn validate_input(input: &ProposeInput<'_>) -> Result<usize> {
    let cu = input.cu_num_tokens;
    let batch_size = cu
        .len()
        .checked_sub(1)
        .ok_or_else(|| Error::shape("cu_num_tokens", 1, 0))?;

    if cu[0] != 0 {
        return Err(Error::Precondition(format!(
            "cu_num_tokens must start at 0, got {}",
            cu[0]
        )));
    }
    for (i, bounds) in cu.windows(2).enumerate() {
        if bounds[1] <= bounds[0] {
            return Err(Error::Precondition(format!(
                "request {i} has no accepted tokens ({} -> {})",
                bounds[0], bounds[1]
            )));
        }
    }

    let num_tokens = cu[batch_size];
    let next_len = input.next_token_ids.dims1()?;
    if next_len != batch_size {
        return Err(Error::shape("next_token_ids", batch_size, next_len));
    }
    if input.block_tables.len() != batch_size {
        return Err(Error::shape("block_tables", batch_size, input.block_tables.len()));
    }
    if input.sampling_metadata.len() != batch_size {
        return Err(Error::shape(
            "sampling_metadata",
            batch_size,
            input.sampling_metadata.len(),
        ));
    }

    let ids_len = input.target_token_ids.dims1()?;
    if ids_len != num_tokens {
        return Err(Error::shape("target_token_ids", num_tokens, ids_len));
    }
    if input.target_positions.len() != num_tokens {
        return Err(Error::shape(
            "target_positions",
            num_tokens,
            input.target_positions.len(),
        ));
    }
    if input.target_slot_mapping.len() != num_tokens {
        return Err(Error::shape(
            "target_slot_mapping",
            num_tokens,
            input.target_slot_mapping.len(),
        ));
    }
    let (hidden_rows, _) = input.target_hidden_states.dims2()?;
    if hidden_rows != num_tokens {
        return Err(Error::shape("target_hidden_states", num_tokens, hidden_rows));
    }
    Ok(batch_size)
}
