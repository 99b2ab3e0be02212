use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use tracing::info;

use nano_eagle::core::{BlockTable, DraftKvCache, KvCacheSpec};
use nano_eagle::speculative::{
    select_accepted, select_accepted_host, ConfigLayerRegistry, DraftModel, ModelProvider,
    TargetModel,
};
use nano_eagle::{
    init_logging, remap, DraftLoader, DraftMethod, EagleDraftModel, EagleProposer, Error,
    LogConfig, LogFormat, ModelConfig, ParallelConfig, ProposeInput, Result, SamplingConfig,
    SamplingMetadata, Sampler, SpeculativeConfig, TargetWeights, TokenResidency,
};

#[derive(Parser, Debug)]
#[command(name = "nano-eagle")]
#[command(about = "EAGLE speculative drafting on a synthetic batch")]
struct Args {
    /// Speculative config JSON; overrides --method, -k and --residency
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drafting method
    #[arg(long, default_value = "eagle")]
    method: DraftMethod,

    /// Tokens to draft per request
    #[arg(short, long, default_value = "4")]
    k: usize,

    /// Number of requests
    #[arg(short, long, default_value = "4")]
    batch_size: usize,

    /// Tokens verified per request in the previous cycle
    #[arg(long, default_value = "8")]
    query_len: usize,

    /// Sampling temperature (0 = greedy)
    #[arg(long, default_value = "0")]
    temperature: f32,

    /// Where draft tokens live between steps
    #[arg(long, value_enum, default_value = "host")]
    residency: Residency,

    /// RNG seed for weights, rejections and sampling
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Log filter directive
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Residency {
    Host,
    Device,
}

const BLOCK_SIZE: usize = 16;

fn tiny_config(num_hidden_layers: usize, draft_vocab_size: Option<usize>) -> ModelConfig {
    ModelConfig {
        vocab_size: 128,
        hidden_size: 64,
        intermediate_size: 128,
        num_hidden_layers,
        num_attention_heads: 4,
        num_key_value_heads: 2,
        head_dim: None,
        rms_norm_eps: 1e-6,
        rope_theta: 10000.0,
        max_position_embeddings: 512,
        tie_word_embeddings: true,
        draft_vocab_size,
        target_hidden_size: None,
        layer_offset: 0,
    }
}

/// Builds random-weight draft heads of the tiny geometry.
struct RandomModelProvider {
    device: Device,
}

impl ModelProvider for RandomModelProvider {
    fn draft_config(&self, config: &SpeculativeConfig) -> Result<ModelConfig> {
        Ok(match config.method {
            DraftMethod::Eagle => tiny_config(1, None),
            DraftMethod::Eagle3 => tiny_config(1, Some(96)),
        })
    }

    fn build_model(
        &self,
        config: &SpeculativeConfig,
        draft_config: &ModelConfig,
    ) -> Result<Box<dyn DraftModel>> {
        let model =
            EagleDraftModel::new_random(draft_config, config.method, DType::F32, &self.device)?;
        Ok(Box::new(model))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&LogConfig {
        format: if args.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        level: args.log_level.clone(),
    })?;

    let config = match &args.config {
        Some(path) => SpeculativeConfig::from_json_file(path)?,
        None => SpeculativeConfig::new("random")
            .target("random")
            .method(args.method)
            .num_tokens(args.k)
            .token_residency(match args.residency {
                Residency::Host => TokenResidency::Host,
                Residency::Device => TokenResidency::Device,
            }),
    };
    config.validate()?;
    if args.query_len == 0 {
        return Err(Error::Config("--query-len must be at least 1".into()));
    }
    let k = config.num_speculative_tokens;
    info!(version = env!("CARGO_PKG_VERSION"), method = %config.method, k, "nano-eagle");

    let device = Device::Cpu;
    let mut rng = rand::rngs::StdRng::seed_from_u64(args.seed);

    // Target weights: only the embedding table and head are needed.
    let target_config = tiny_config(2, None);
    let varmap = VarMap::new();
    let target = TargetWeights::from_var_builder(
        target_config.clone(),
        VarBuilder::from_varmap(&varmap, DType::F32, &device),
    )?;

    let provider = RandomModelProvider {
        device: device.clone(),
    };
    let parallel = ParallelConfig::default();
    let loaded = DraftLoader::new(&provider, &ConfigLayerRegistry, &parallel).load(&config, &target)?;
    info!(
        layers = ?loaded.attn_layer_names,
        embed_shared = loaded.model.embed_tokens().aliases(target.embed_tokens()),
        "Draft ready"
    );

    // One block table per request, long enough for the prompt and k drafts.
    let blocks_per_request = (args.query_len + k + 1).div_ceil(BLOCK_SIZE);
    let block_tables: Vec<BlockTable> = (0..args.batch_size)
        .map(|r| {
            let first = r * blocks_per_request;
            BlockTable::from_block_ids(BLOCK_SIZE, (first..first + blocks_per_request).collect())
        })
        .collect();

    let spec = KvCacheSpec::new(
        args.batch_size * blocks_per_request,
        BLOCK_SIZE,
        target_config.num_key_value_heads,
        target_config.head_dim(),
    );
    let kv_cache = DraftKvCache::new(&loaded.attn_layer_names, spec, &device)?;

    let mut proposer = EagleProposer::new(loaded, &config)?
        .with_sampler(Box::new(Sampler::with_seed(args.seed)));
    proposer.bind_kv_cache(kv_cache)?;
    proposer.dummy_run(args.batch_size)?;

    // The previous cycle verified `query_len` tokens per request.
    let cu_target_query_lens: Vec<usize> =
        (0..=args.batch_size).map(|r| r * args.query_len).collect();
    let num_rejected: Vec<usize> = (0..args.batch_size)
        .map(|_| rng.gen_range(0..args.query_len))
        .collect();
    let total: usize = args.batch_size * args.query_len - num_rejected.iter().sum::<usize>();
    let map = remap(&cu_target_query_lens, &num_rejected, total)?;

    let num_target_tokens = args.batch_size * args.query_len;
    let token_ids: Vec<u32> = (0..num_target_tokens)
        .map(|_| rng.gen_range(0..target_config.vocab_size as u32))
        .collect();
    let positions: Vec<usize> = (0..num_target_tokens).map(|t| t % args.query_len).collect();
    let slots: Vec<i64> = positions
        .iter()
        .enumerate()
        .map(|(t, &p)| {
            block_tables[t / args.query_len]
                .slot_for_position(p)
                .map(|s| s as i64)
        })
        .collect::<Result<_>>()?;
    // EAGLE-3 reads the concatenated outputs of three target layers.
    let hidden = match config.method {
        DraftMethod::Eagle => Tensor::randn(
            0f32,
            1.0,
            (num_target_tokens, target_config.hidden_size),
            &device,
        )?,
        DraftMethod::Eagle3 => {
            let aux_layers = config.aux_hidden_state_layers(target_config.num_hidden_layers);
            info!(?aux_layers, "Synthesising auxiliary target states");
            let parts = aux_layers
                .iter()
                .map(|_| {
                    Tensor::randn(
                        0f32,
                        1.0,
                        (num_target_tokens, target_config.hidden_size),
                        &device,
                    )
                })
                .collect::<candle_core::Result<Vec<_>>>()?;
            Tensor::cat(&parts, 1)?
        }
    };
    let next_token_ids: Vec<u32> = (0..args.batch_size)
        .map(|_| rng.gen_range(0..target_config.vocab_size as u32))
        .collect();

    let token_ids = select_accepted(&Tensor::new(token_ids, &device)?, &map)?;
    let hidden = select_accepted(&hidden, &map)?;
    let positions = select_accepted_host(&positions, &map)?;
    let slots = select_accepted_host(&slots, &map)?;
    let next_token_ids = Tensor::new(next_token_ids, &device)?;

    let sampling = if args.temperature > 0.0 {
        SamplingConfig {
            temperature: args.temperature,
            ..Default::default()
        }
    } else {
        SamplingConfig::greedy()
    };
    let metadata = SamplingMetadata::uniform(sampling, args.batch_size);

    let draft = proposer.propose(&ProposeInput {
        target_token_ids: &token_ids,
        target_positions: &positions,
        target_hidden_states: &hidden,
        target_slot_mapping: &slots,
        next_token_ids: &next_token_ids,
        cu_num_tokens: &map.cu_num_tokens,
        block_tables: &block_tables,
        sampling_metadata: &metadata,
    })?;

    for (request, row) in draft.to_vec2::<u32>()?.iter().enumerate() {
        println!(
            "request {request}: accepted {} -> draft {row:?}",
            map.run(request).len()
        );
    }
    Ok(())
}
