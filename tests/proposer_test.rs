//! Integration tests for the draft loop.
//!
//! A scripted draft model stands in for the network: it returns zero hidden
//! states and logits whose arg-max is `start[request] + step`.

use std::cell::Cell;
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use nano_eagle::core::kv_cache::{DraftKvCache, KvCacheSpec};
use nano_eagle::core::{BlockTable, PADDING_SLOT_ID};
use nano_eagle::engine::{DraftSampler, SamplingMetadata};
use nano_eagle::speculative::{DraftBatch, DraftModel, DraftOutput};
use nano_eagle::{
    DraftMethod, EagleProposer, Error, LoadedDraft, ProposeInput, SamplingConfig,
    SpeculativeConfig, TokenResidency, Weight,
};

const HIDDEN: usize = 8;
const VOCAB: usize = 128;
const DRAFT_LAYER: &str = "model.layers.2.self_attn";

/// What the proposer fed the model on each forward call.
#[derive(Debug, Clone, Default)]
struct Call {
    input_ids: Vec<u32>,
    positions: Vec<usize>,
    slot_mapping: Vec<i64>,
    seq_lens: Vec<usize>,
    query_start_loc: Vec<usize>,
}

struct ScriptedDraft {
    embed: Weight,
    lm_head: Weight,
    starts: Vec<u32>,
    step: Cell<u32>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl ScriptedDraft {
    fn new(starts: Vec<u32>) -> (Self, Arc<Mutex<Vec<Call>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let embed = Tensor::zeros((VOCAB, HIDDEN), DType::F32, &Device::Cpu).unwrap();
        let model = Self {
            embed: Weight::Owned(embed.clone()),
            lm_head: Weight::Owned(embed),
            starts,
            step: Cell::new(0),
            calls: Arc::clone(&calls),
        };
        (model, calls)
    }
}

impl DraftModel for ScriptedDraft {
    fn hidden_size(&self) -> usize {
        HIDDEN
    }

    fn embed_tokens(&self) -> &Weight {
        &self.embed
    }

    fn set_embed_tokens(&mut self, weight: Weight) {
        self.embed = weight;
    }

    fn lm_head(&self) -> &Weight {
        &self.lm_head
    }

    fn set_lm_head(&mut self, weight: Weight) {
        self.lm_head = weight;
    }

    fn combine_hidden_states(&self, hidden_states: &Tensor) -> nano_eagle::Result<Tensor> {
        Ok(hidden_states.narrow(1, 0, HIDDEN)?)
    }

    fn forward(
        &mut self,
        batch: &DraftBatch<'_>,
        _kv_cache: Option<&mut DraftKvCache>,
    ) -> nano_eagle::Result<DraftOutput> {
        self.calls.lock().unwrap().push(Call {
            input_ids: batch.input_ids.to_vec1::<u32>()?,
            positions: batch.positions.to_vec(),
            slot_mapping: batch.slot_mapping.to_vec(),
            seq_lens: batch.seq_lens.to_vec(),
            query_start_loc: batch.query_start_loc.to_vec(),
        });
        let hidden = Tensor::zeros((batch.num_rows(), HIDDEN), DType::F32, &Device::Cpu)?;
        Ok(DraftOutput {
            last_hidden_states: hidden.clone(),
            hidden_states: hidden,
        })
    }

    fn compute_logits(&self, hidden_states: &Tensor) -> nano_eagle::Result<Tensor> {
        let rows = hidden_states.dim(0)?;
        let step = self.step.get();
        self.step.set(step + 1);

        let mut logits = vec![0f32; rows * VOCAB];
        for (r, &start) in self.starts.iter().take(rows).enumerate() {
            logits[r * VOCAB + (start + step) as usize] = 10.0;
        }
        Ok(Tensor::from_vec(logits, (rows, VOCAB), &Device::Cpu)?)
    }
}

/// Always proposes the same token.
struct ConstantSampler(u32);

impl DraftSampler for ConstantSampler {
    fn sample(
        &mut self,
        logits: &Tensor,
        _metadata: &SamplingMetadata,
    ) -> nano_eagle::Result<Tensor> {
        let rows = logits.dim(0)?;
        Ok(Tensor::new(vec![self.0; rows], logits.device())?)
    }
}

fn build_proposer(
    method: DraftMethod,
    config: &SpeculativeConfig,
    starts: Vec<u32>,
) -> (EagleProposer, Arc<Mutex<Vec<Call>>>) {
    let (model, calls) = ScriptedDraft::new(starts);
    let loaded = LoadedDraft {
        model: Box::new(model),
        attn_layer_names: vec![DRAFT_LAYER.to_string()],
        strategy: method.strategy(),
    };
    (EagleProposer::new(loaded, config).unwrap(), calls)
}

/// Two requests: request 0 accepted positions 0..3, request 1 accepted 0..2.
struct Fixture {
    token_ids: Tensor,
    positions: Vec<usize>,
    hidden: Tensor,
    slots: Vec<i64>,
    next_token_ids: Tensor,
    cu_num_tokens: Vec<usize>,
    block_tables: Vec<BlockTable>,
    metadata: SamplingMetadata,
}

impl Fixture {
    fn new(hidden_width: usize) -> Self {
        let device = Device::Cpu;
        let block_tables = vec![
            BlockTable::from_block_ids(4, vec![0, 1, 2]),
            BlockTable::from_block_ids(4, vec![3, 4, 5]),
        ];
        Self {
            token_ids: Tensor::new(&[1u32, 2, 3, 7, 8], &device).unwrap(),
            positions: vec![0, 1, 2, 0, 1],
            hidden: Tensor::zeros((5, hidden_width), DType::F32, &device).unwrap(),
            slots: vec![0, 1, 2, 12, 13],
            next_token_ids: Tensor::new(&[4u32, 9], &device).unwrap(),
            cu_num_tokens: vec![0, 3, 5],
            block_tables,
            metadata: SamplingMetadata::greedy(2),
        }
    }

    fn input(&self) -> ProposeInput<'_> {
        ProposeInput {
            target_token_ids: &self.token_ids,
            target_positions: &self.positions,
            target_hidden_states: &self.hidden,
            target_slot_mapping: &self.slots,
            next_token_ids: &self.next_token_ids,
            cu_num_tokens: &self.cu_num_tokens,
            block_tables: &self.block_tables,
            sampling_metadata: &self.metadata,
        }
    }
}

#[test]
fn test_greedy_draft_sequences() {
    for k in [1usize, 3, 8] {
        let config = SpeculativeConfig::default().num_tokens(k);
        let (mut proposer, _) = build_proposer(DraftMethod::Eagle, &config, vec![42, 60]);
        let fixture = Fixture::new(HIDDEN);

        let draft = proposer.propose(&fixture.input()).unwrap();
        assert_eq!(draft.dims(), &[2, k]);
        assert_eq!(draft.dtype(), DType::U32);

        let expected: Vec<Vec<u32>> = vec![
            (42..42 + k as u32).collect(),
            (60..60 + k as u32).collect(),
        ];
        assert_eq!(draft.to_vec2::<u32>().unwrap(), expected);
    }
}

#[test]
fn test_k3_matches_reference_output() {
    let config = SpeculativeConfig::default().num_tokens(3);
    let (mut proposer, _) = build_proposer(DraftMethod::Eagle, &config, vec![42, 60]);
    let fixture = Fixture::new(HIDDEN);

    let draft = proposer.propose(&fixture.input()).unwrap();
    assert_eq!(
        draft.to_vec2::<u32>().unwrap(),
        vec![vec![42, 43, 44], vec![60, 61, 62]]
    );
}

#[test]
fn test_device_residency_matches_host() {
    let fixture = Fixture::new(HIDDEN);
    let host_config = SpeculativeConfig::default().num_tokens(4);
    let device_config = host_config.clone().token_residency(TokenResidency::Device);

    let (mut host, _) = build_proposer(DraftMethod::Eagle, &host_config, vec![42, 60]);
    let (mut device, _) = build_proposer(DraftMethod::Eagle, &device_config, vec![42, 60]);

    let host_draft = host.propose(&fixture.input()).unwrap();
    let device_draft = device.propose(&fixture.input()).unwrap();
    assert_eq!(
        host_draft.to_vec2::<u32>().unwrap(),
        device_draft.to_vec2::<u32>().unwrap()
    );
}

#[test]
fn test_empty_batch_skips_model() {
    for k in [1usize, 3, 8] {
        let config = SpeculativeConfig::default().num_tokens(k);
        let (mut proposer, calls) = build_proposer(DraftMethod::Eagle, &config, vec![]);
        let device = Device::Cpu;

        let ids = Tensor::zeros(0, DType::U32, &device).unwrap();
        let hidden = Tensor::zeros((0, HIDDEN), DType::F32, &device).unwrap();
        let next = Tensor::zeros(0, DType::U32, &device).unwrap();
        let metadata = SamplingMetadata::greedy(0);
        let input = ProposeInput {
            target_token_ids: &ids,
            target_positions: &[],
            target_hidden_states: &hidden,
            target_slot_mapping: &[],
            next_token_ids: &next,
            cu_num_tokens: &[0],
            block_tables: &[],
            sampling_metadata: &metadata,
        };

        let draft = proposer.propose(&input).unwrap();
        assert_eq!(draft.dims(), &[0, k]);
        assert!(calls.lock().unwrap().is_empty());
    }
}

#[test]
fn test_step_inputs() {
    let config = SpeculativeConfig::default().num_tokens(3);
    let (mut proposer, calls) = build_proposer(DraftMethod::Eagle, &config, vec![42, 60]);
    let fixture = Fixture::new(HIDDEN);
    proposer.propose(&fixture.input()).unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 3);

    // Step 0: accepted rows plus the bonus token of each request.
    let prefill = &calls[0];
    assert_eq!(prefill.input_ids, vec![1, 2, 3, 4, 7, 8, 9]);
    assert_eq!(prefill.positions, vec![0, 1, 2, 3, 0, 1, 2]);
    assert_eq!(prefill.slot_mapping, vec![0, 1, 2, 3, 12, 13, 14]);
    assert_eq!(prefill.query_start_loc, vec![0, 4, 7]);
    assert_eq!(prefill.seq_lens, vec![4, 3]);

    // Step 1: one row per request, fed the previous step's tokens.
    let decode = &calls[1];
    assert_eq!(decode.input_ids, vec![42, 60]);
    assert_eq!(decode.positions, vec![4, 3]);
    assert_eq!(decode.slot_mapping, vec![4, 15]);
    assert_eq!(decode.query_start_loc, vec![0, 1, 2]);
    assert_eq!(decode.seq_lens, vec![5, 4]);

    let decode = &calls[2];
    assert_eq!(decode.input_ids, vec![43, 61]);
    assert_eq!(decode.positions, vec![5, 4]);
    assert_eq!(decode.slot_mapping, vec![5, 16]);
}

#[test]
fn test_positions_clamped_past_max_model_len() {
    let config = SpeculativeConfig::default().num_tokens(3).max_model_len(5);
    let (mut proposer, calls) = build_proposer(DraftMethod::Eagle, &config, vec![42, 60]);
    let fixture = Fixture::new(HIDDEN);

    let draft = proposer.propose(&fixture.input()).unwrap();
    assert_eq!(draft.dims(), &[2, 3]);

    let calls = calls.lock().unwrap();
    // Request 0 reaches position 5 on step 2; request 1 stays below.
    let last = &calls[2];
    assert_eq!(last.positions, vec![0, 4]);
    assert_eq!(last.slot_mapping, vec![PADDING_SLOT_ID, 16]);
    assert_eq!(last.seq_lens, vec![1, 5]);
}

#[test]
fn test_cache_exhaustion_is_reported() {
    let config = SpeculativeConfig::default().num_tokens(4);
    let (mut proposer, _) = build_proposer(DraftMethod::Eagle, &config, vec![42, 60]);
    let mut fixture = Fixture::new(HIDDEN);
    // Request 1 only owns one block: positions 0..4.
    fixture.block_tables[1] = BlockTable::from_block_ids(4, vec![3]);

    let err = proposer.propose(&fixture.input()).unwrap_err();
    assert!(matches!(
        err,
        Error::CacheExhausted {
            request: 1,
            position: 4
        }
    ));
}

#[test]
fn test_shape_mismatches_fail_fast() {
    let config = SpeculativeConfig::default().num_tokens(2);
    let (mut proposer, calls) = build_proposer(DraftMethod::Eagle, &config, vec![42, 60]);

    let mut fixture = Fixture::new(HIDDEN);
    fixture.block_tables.pop();
    assert!(matches!(
        proposer.propose(&fixture.input()),
        Err(Error::ShapeMismatch { what: "block_tables", .. })
    ));

    let mut fixture = Fixture::new(HIDDEN);
    fixture.positions.pop();
    assert!(matches!(
        proposer.propose(&fixture.input()),
        Err(Error::ShapeMismatch { what: "target_positions", .. })
    ));

    let mut fixture = Fixture::new(HIDDEN);
    fixture.next_token_ids = Tensor::new(&[4u32], &Device::Cpu).unwrap();
    assert!(matches!(
        proposer.propose(&fixture.input()),
        Err(Error::ShapeMismatch { what: "next_token_ids", .. })
    ));

    let mut fixture = Fixture::new(HIDDEN);
    fixture.metadata = SamplingMetadata::greedy(3);
    assert!(matches!(
        proposer.propose(&fixture.input()),
        Err(Error::ShapeMismatch { what: "sampling_metadata", .. })
    ));

    let fixture = Fixture::new(HIDDEN + 1);
    assert!(matches!(
        proposer.propose(&fixture.input()),
        Err(Error::ShapeMismatch { .. })
    ));

    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn test_combined_hidden_states_for_eagle3() {
    let config = SpeculativeConfig::default()
        .method(DraftMethod::Eagle3)
        .num_tokens(2);
    let (mut proposer, _) = build_proposer(DraftMethod::Eagle3, &config, vec![42, 60]);
    let fixture = Fixture::new(3 * HIDDEN);

    let draft = proposer.propose(&fixture.input()).unwrap();
    assert_eq!(draft.to_vec2::<u32>().unwrap(), vec![vec![42, 43], vec![60, 61]]);

    // EAGLE does not combine, so the wide features are rejected.
    let config = SpeculativeConfig::default().num_tokens(2);
    let (mut proposer, _) = build_proposer(DraftMethod::Eagle, &config, vec![42, 60]);
    assert!(matches!(
        proposer.propose(&fixture.input()),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn test_pluggable_sampler() {
    let config = SpeculativeConfig::default().num_tokens(3);
    let (proposer, _) = build_proposer(DraftMethod::Eagle, &config, vec![42, 60]);
    let mut proposer = proposer.with_sampler(Box::new(ConstantSampler(7)));

    // Greedy requests never reach the policy.
    let fixture = Fixture::new(HIDDEN);
    let draft = proposer.propose(&fixture.input()).unwrap();
    assert_eq!(draft.to_vec2::<u32>().unwrap()[0], vec![42, 43, 44]);

    let mut fixture = Fixture::new(HIDDEN);
    fixture.metadata = SamplingMetadata::uniform(SamplingConfig::default(), 2);
    let draft = proposer.propose(&fixture.input()).unwrap();
    assert_eq!(draft.to_vec2::<u32>().unwrap(), vec![vec![7; 3], vec![7; 3]]);
}

#[test]
fn test_bind_kv_cache_requires_draft_layers() {
    let config = SpeculativeConfig::default();
    let (mut proposer, _) = build_proposer(DraftMethod::Eagle, &config, vec![]);
    let spec = KvCacheSpec::new(4, 4, 1, 4);

    let wrong = DraftKvCache::new(&["model.layers.0.self_attn"], spec.clone(), &Device::Cpu).unwrap();
    assert!(matches!(
        proposer.bind_kv_cache(wrong),
        Err(Error::Precondition(_))
    ));

    let right = DraftKvCache::new(&[DRAFT_LAYER], spec, &Device::Cpu).unwrap();
    proposer.bind_kv_cache(right).unwrap();
    assert!(proposer.kv_cache().is_some());
}

#[test]
fn test_dummy_run_uses_padding_slots() {
    let config = SpeculativeConfig::default();
    let (mut proposer, calls) = build_proposer(DraftMethod::Eagle, &config, vec![]);

    proposer.dummy_run(0).unwrap();
    assert!(calls.lock().unwrap().is_empty());

    proposer.dummy_run(3).unwrap();
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].slot_mapping, vec![PADDING_SLOT_ID; 3]);
    assert_eq!(calls[0].positions, vec![0; 3]);
}
