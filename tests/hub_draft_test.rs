//! Integration tests against a real EAGLE checkpoint.
//!
//! These tests download a draft head from the HuggingFace Hub and are
//! marked with `#[ignore]` since they require network access and several
//! hundred MB of disk space.
//!
//! The checkpoint can be overridden with `NANO_EAGLE_DRAFT` (a Hub id or a
//! local directory holding `config.json` and SafeTensors weights).
//!
//! Run with: `cargo test --test hub_draft_test -- --ignored`

use candle_core::{DType, Device, Tensor};
use nano_eagle::core::block::{BlockTable, PADDING_SLOT_ID};
use nano_eagle::speculative::{DraftBatch, ModelProvider};
use nano_eagle::{DraftMethod, ModelFiles, SafetensorsModelProvider, SpeculativeConfig};

const DEFAULT_DRAFT: &str = "yuhuili/EAGLE-LLaMA3.1-Instruct-8B";

fn draft_id() -> String {
    std::env::var("NANO_EAGLE_DRAFT").unwrap_or_else(|_| DEFAULT_DRAFT.to_string())
}

#[test]
#[ignore]
fn test_resolve_checkpoint() -> anyhow::Result<()> {
    let files = ModelFiles::resolve(&draft_id(), "main")?;
    assert!(files.config.exists());
    assert!(!files.weights.is_empty());
    Ok(())
}

#[test]
#[ignore]
fn test_load_and_run_draft_head() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let config = SpeculativeConfig::new(draft_id()).method(DraftMethod::Eagle);
    let provider = SafetensorsModelProvider::new(DType::F32, device.clone());

    let mut draft_config = provider.draft_config(&config)?;
    draft_config.layer_offset = 32;
    let mut model = provider.build_model(&config, &draft_config)?;
    assert_eq!(model.hidden_size(), draft_config.hidden_size);

    let ids = Tensor::new(&[128000u32, 791, 4062], &device)?;
    let hidden = Tensor::zeros((3, draft_config.hidden_size), DType::F32, &device)?;
    let positions = [0usize, 1, 2];
    let slots = [PADDING_SLOT_ID; 3];
    let tables = [BlockTable::default()];
    let batch = DraftBatch {
        input_ids: &ids,
        positions: &positions,
        hidden_states: &hidden,
        slot_mapping: &slots,
        query_start_loc: &[0, 3],
        seq_lens: &[3],
        block_tables: &tables,
    };

    let output = model.forward(&batch, None)?;
    let logits = model.compute_logits(&output.last_hidden_states)?;
    assert_eq!(logits.dims(), &[3, draft_config.vocab_size]);
    Ok(())
}
