//! Block tables for the paged KV cache.
//!
//! The cache manager owns physical blocks; the drafter only reads a
//! request's block table to turn logical positions into physical slots.

use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Slot id meaning "do not write this row into the cache".
pub const PADDING_SLOT_ID: i64 = -1;

/// Maps a request's logical positions to physical block IDs.
///
/// Token at position `p` is stored in:
/// - Logical block: `p / block_size`
/// - Slot within block: `p % block_size`
/// - Physical block: `block_ids[p / block_size]`
///
/// # Example
///
/// ```
/// use nano_eagle::core::block::BlockTable;
///
/// let table = BlockTable::from_block_ids(16, vec![5, 12, 3]);
///
/// // Token 20 -> logical block 1 -> physical block 12 -> slot 12 * 16 + 4
/// assert_eq!(table.slot_for_position(20).unwrap(), 196);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<usize>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Create a block table from already allocated physical blocks.
    pub fn from_block_ids(block_size: usize, block_ids: Vec<usize>) -> Self {
        Self {
            block_ids,
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Add a new physical block to the table.
    pub fn append_block(&mut self, block_id: usize) {
        self.block_ids.push(block_id);
    }

    /// Number of blocks allocated to this request.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Number of token positions the table can address.
    pub fn capacity(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// Get all physical block IDs for this request.
    pub fn physical_block_ids(&self) -> &[usize] {
        &self.block_ids
    }

    /// Global slot index of the token at `position`, if a block covers it.
    ///
    /// Global slot = `block_id * block_size + slot_within_block`
    pub fn try_slot_for_position(&self, position: usize) -> Option<usize> {
        if self.block_size == 0 {
            return None;
        }
        self.block_ids
            .get(position / self.block_size)
            .map(|&block| block * self.block_size + position % self.block_size)
    }

    /// Global slot index of the token at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheExhausted`] (with request index 0) when the
    /// table does not reach `position`; callers that know the request index
    /// should prefer [`BlockTable::try_slot_for_position`].
    pub fn slot_for_position(&self, position: usize) -> Result<usize> {
        self.try_slot_for_position(position)
            .ok_or(Error::CacheExhausted {
                request: 0,
                position,
            })
    }

    /// Global slots for positions `0..context_len`, in order.
    pub fn context_slots(&self, context_len: usize) -> Result<Vec<u32>> {
        (0..context_len)
            .map(|pos| self.slot_for_position(pos).map(|slot| slot as u32))
            .collect()
    }
}
