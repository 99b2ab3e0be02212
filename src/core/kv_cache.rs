//! Paged K/V storage for the draft-only attention layers.
//!
//! The draft network owns a handful of attention layers the target model
//! does not have. The cache allocator sizes one pool per such layer, keyed by
//! the layer names the loader recorded.
//!
//! ## Memory Layout
//!
//! Each layer keeps separate key and value pools of shape
//! `[num_blocks * block_size, num_kv_heads, head_dim]`, addressed directly by
//! global slot id (`block_id * block_size + offset`).

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};

use crate::core::block::PADDING_SLOT_ID;
use crate::error::{Error, Result};

/// Geometry of a paged K/V pool.
#[derive(Debug, Clone)]
pub struct KvCacheSpec {
    /// Number of blocks.
    pub num_blocks: usize,
    /// Tokens per block.
    pub block_size: usize,
    /// Number of KV heads.
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Data type for cache tensors.
    pub dtype: DType,
}

impl KvCacheSpec {
    /// Create a new spec with `f32` storage.
    pub fn new(num_blocks: usize, block_size: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_blocks,
            block_size,
            num_kv_heads,
            head_dim,
            dtype: DType::F32,
        }
    }

    /// Set the data type.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Total addressable slots.
    pub fn num_slots(&self) -> usize {
        self.num_blocks * self.block_size
    }

    /// Bytes for one layer (K and V).
    pub fn layer_size_bytes(&self) -> usize {
        self.num_slots() * self.num_kv_heads * self.head_dim * self.dtype.size_in_bytes() * 2
    }
}

/// K/V pools for one attention layer.
#[derive(Debug)]
pub struct LayerKvCache {
    /// Key pool: [num_slots, num_kv_heads, head_dim]
    key_cache: Tensor,
    /// Value pool: [num_slots, num_kv_heads, head_dim]
    value_cache: Tensor,
}

impl LayerKvCache {
    /// Allocate zeroed pools.
    pub fn new(spec: &KvCacheSpec, device: &Device) -> Result<Self> {
        let shape = (spec.num_slots(), spec.num_kv_heads, spec.head_dim);
        Ok(Self {
            key_cache: Tensor::zeros(shape, spec.dtype, device)?,
            value_cache: Tensor::zeros(shape, spec.dtype, device)?,
        })
    }

    /// Get the key pool.
    pub fn key_cache(&self) -> &Tensor {
        &self.key_cache
    }

    /// Get the value pool.
    pub fn value_cache(&self) -> &Tensor {
        &self.value_cache
    }

    /// Write one K/V row per token into the pools.
    ///
    /// `key` and `value` are `[num_tokens, num_kv_heads, head_dim]`; rows
    /// whose slot is [`PADDING_SLOT_ID`] are skipped.
    pub fn write(&mut self, key: &Tensor, value: &Tensor, slot_mapping: &[i64]) -> Result<()> {
        let num_tokens = key.dim(0)?;
        if slot_mapping.len() != num_tokens {
            return Err(Error::shape("slot_mapping", num_tokens, slot_mapping.len()));
        }
        let num_slots = self.key_cache.dim(0)?;

        // Row-by-row scatter; a fused kernel would do this in one launch.
        for (row, &slot) in slot_mapping.iter().enumerate() {
            if slot == PADDING_SLOT_ID {
                continue;
            }
            let slot = usize::try_from(slot)
                .ok()
                .filter(|&s| s < num_slots)
                .ok_or_else(|| {
                    Error::Precondition(format!("slot {slot} outside cache of {num_slots} slots"))
                })?;
            let k_row = key.narrow(0, row, 1)?.to_dtype(self.key_cache.dtype())?;
            let v_row = value.narrow(0, row, 1)?.to_dtype(self.value_cache.dtype())?;
            self.key_cache = self.key_cache.slice_scatter0(&k_row, slot)?;
            self.value_cache = self.value_cache.slice_scatter0(&v_row, slot)?;
        }
        Ok(())
    }

    /// Gather K/V rows for the given slots.
    ///
    /// Returns `([n, num_kv_heads, head_dim], [n, num_kv_heads, head_dim])`.
    pub fn gather(&self, slots: &[u32]) -> Result<(Tensor, Tensor)> {
        let index = Tensor::new(slots, self.key_cache.device())?;
        let keys = self.key_cache.index_select(&index, 0)?;
        let values = self.value_cache.index_select(&index, 0)?;
        Ok((keys, values))
    }
}

/// Paged K/V storage for every draft-only attention layer.
#[derive(Debug)]
pub struct DraftKvCache {
    /// Per-layer pools keyed by attention layer name.
    layers: BTreeMap<String, LayerKvCache>,
    /// Geometry shared by all layers.
    spec: KvCacheSpec,
    /// Device.
    device: Device,
}

impl DraftKvCache {
    /// Allocate one pool per layer name.
    pub fn new<S: AsRef<str>>(layer_names: &[S], spec: KvCacheSpec, device: &Device) -> Result<Self> {
        let mut layers = BTreeMap::new();
        for name in layer_names {
            layers.insert(name.as_ref().to_string(), LayerKvCache::new(&spec, device)?);
        }
        Ok(Self {
            layers,
            spec,
            device: device.clone(),
        })
    }

    /// Names of the layers that have a pool, in sorted order.
    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    /// Whether the pools cover exactly `names`.
    pub fn covers_exactly<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.len() == self.layers.len()
            && names.iter().all(|n| self.layers.contains_key(n.as_ref()))
    }

    /// Get the pool for a layer.
    pub fn layer(&self, name: &str) -> Option<&LayerKvCache> {
        self.layers.get(name)
    }

    /// Get mutable access to a layer's pool.
    pub fn layer_mut(&mut self, name: &str) -> Result<&mut LayerKvCache> {
        self.layers
            .get_mut(name)
            .ok_or_else(|| Error::Precondition(format!("no KV cache allocated for layer {name}")))
    }

    /// Get the geometry.
    pub fn spec(&self) -> &KvCacheSpec {
        &self.spec
    }

    /// Get the device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Total bytes held by all pools.
    pub fn total_size_bytes(&self) -> usize {
        self.spec.layer_size_bytes() * self.layers.len()
    }
}
