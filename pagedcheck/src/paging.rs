//! Paged KV cache addressing and precondition checks.
//!
//! A sequence's tokens live in fixed-capacity blocks drawn from a shared
//! pool, addressed indirectly through per-sequence block tables. A slot
//! index is a linear position in the virtual (num_blocks × capacity)
//! space; translation to (block, offset) is plain div/mod. Out-of-range
//! indices are precondition violations reported to the caller, never
//! clamped.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Geometry of the physical block pool and the per-slot payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedLayout {
    /// Number of tokens stored per block.
    pub block_capacity: usize,
    /// Total number of blocks in the pool.
    pub num_blocks: usize,
    /// KV heads stored per slot.
    pub num_kv_heads: usize,
    /// Elements per head.
    pub head_size: usize,
}

impl PagedLayout {
    /// Create a layout, validating that no dimension is zero.
    ///
    /// # Panics
    /// Panics if any dimension is zero.
    #[must_use]
    pub fn new(
        block_capacity: usize,
        num_blocks: usize,
        num_kv_heads: usize,
        head_size: usize,
    ) -> Self {
        assert!(block_capacity > 0, "block_capacity must be > 0");
        assert!(num_blocks > 0, "num_blocks must be > 0");
        assert!(num_kv_heads > 0, "num_kv_heads must be > 0");
        assert!(head_size > 0, "head_size must be > 0");
        Self {
            block_capacity,
            num_blocks,
            num_kv_heads,
            head_size,
        }
    }

    /// Total slots in the virtual space.
    #[must_use]
    pub fn num_slots(&self) -> usize {
        self.num_blocks * self.block_capacity
    }

    /// Elements one slot occupies (heads × head_size).
    #[must_use]
    pub fn slot_stride(&self) -> usize {
        self.num_kv_heads * self.head_size
    }

    /// Elements one block occupies when flattened.
    #[must_use]
    pub fn block_numel(&self) -> usize {
        self.block_capacity * self.slot_stride()
    }

    /// Blocks needed to hold `num_tokens` tokens: `ceil(tokens / capacity)`.
    #[must_use]
    pub fn blocks_needed(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_capacity)
    }

    /// Translate a linear slot index to (block index, intra-block offset).
    ///
    /// # Errors
    /// `Error::Precondition` if the slot is outside the pool.
    pub fn slot_to_physical(&self, slot: usize) -> Result<(usize, usize)> {
        if slot >= self.num_slots() {
            return Err(Error::Precondition(format!(
                "slot {slot} outside pool of {} slots",
                self.num_slots()
            )));
        }
        Ok((slot / self.block_capacity, slot % self.block_capacity))
    }

    /// Translate (block index, intra-block offset) back to a slot index.
    ///
    /// # Errors
    /// `Error::Precondition` if either coordinate is out of range.
    pub fn physical_to_slot(&self, block_idx: usize, block_offset: usize) -> Result<usize> {
        if block_idx >= self.num_blocks {
            return Err(Error::Precondition(format!(
                "block {block_idx} outside pool of {} blocks",
                self.num_blocks
            )));
        }
        if block_offset >= self.block_capacity {
            return Err(Error::Precondition(format!(
                "block offset {block_offset} outside capacity {}",
                self.block_capacity
            )));
        }
        Ok(block_idx * self.block_capacity + block_offset)
    }

    /// Flat element offset of (offset, head) inside one block's buffer.
    ///
    /// The physical layout packs (capacity × heads × head_size) per block.
    #[must_use]
    pub fn cell_offset(&self, block_offset: usize, head_idx: usize) -> usize {
        block_offset * self.slot_stride() + head_idx * self.head_size
    }
}

/// Check slot mappings are in bounds and injective within one call.
///
/// Two tokens mapped to the same physical slot would silently overwrite
/// each other's K/V vectors.
///
/// # Errors
/// `Error::Precondition` naming the offending token.
pub fn validate_slot_mappings(slots: &[i32], layout: &PagedLayout) -> Result<()> {
    let mut seen = HashSet::with_capacity(slots.len());
    for (token_idx, &slot) in slots.iter().enumerate() {
        if slot < 0 {
            return Err(Error::Precondition(format!(
                "negative slot {slot} for token {token_idx}"
            )));
        }
        #[allow(clippy::cast_sign_loss)]
        let slot = slot as usize;
        if slot >= layout.num_slots() {
            return Err(Error::Precondition(format!(
                "slot {slot} for token {token_idx} outside pool of {} slots",
                layout.num_slots()
            )));
        }
        if !seen.insert(slot) {
            return Err(Error::Precondition(format!(
                "slot collision: token {token_idx} maps to already-used slot {slot}"
            )));
        }
    }
    Ok(())
}

/// Check every block table entry references a block inside the pool.
///
/// `tables` is row-major (batch, max_blocks_per_seq).
///
/// # Errors
/// `Error::Precondition` naming the offending (sequence, entry).
pub fn validate_block_tables(
    tables: &[i32],
    batch_size: usize,
    max_blocks_per_seq: usize,
    layout: &PagedLayout,
) -> Result<()> {
    if tables.len() != batch_size * max_blocks_per_seq {
        return Err(Error::InvalidShape(format!(
            "block_tables has {} entries, expected {batch_size} x {max_blocks_per_seq}",
            tables.len()
        )));
    }
    for (i, &block) in tables.iter().enumerate() {
        #[allow(clippy::cast_sign_loss)]
        if block < 0 || block as usize >= layout.num_blocks {
            return Err(Error::Precondition(format!(
                "block table entry {} of sequence {} references block {block}, pool has {}",
                i % max_blocks_per_seq,
                i / max_blocks_per_seq,
                layout.num_blocks
            )));
        }
    }
    Ok(())
}

/// Check each context length fits inside its block table row.
///
/// # Errors
/// `Error::Precondition` naming the offending sequence.
pub fn validate_context_lens(
    context_lens: &[i32],
    max_blocks_per_seq: usize,
    layout: &PagedLayout,
) -> Result<()> {
    let max_tokens = max_blocks_per_seq * layout.block_capacity;
    for (seq_idx, &len) in context_lens.iter().enumerate() {
        if len < 0 {
            return Err(Error::Precondition(format!(
                "negative context length {len} for sequence {seq_idx}"
            )));
        }
        #[allow(clippy::cast_sign_loss)]
        if len as usize > max_tokens {
            return Err(Error::Precondition(format!(
                "context length {len} of sequence {seq_idx} exceeds {max_blocks_per_seq} \
                 blocks x {} capacity",
                layout.block_capacity
            )));
        }
    }
    Ok(())
}

/// Check the grouped-query head ratio.
///
/// # Errors
/// `Error::Precondition` unless `num_heads` is a positive multiple of
/// `num_kv_heads`.
pub fn validate_head_geometry(num_heads: usize, num_kv_heads: usize) -> Result<()> {
    if num_heads == 0 || num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
        return Err(Error::Precondition(format!(
            "num_heads {num_heads} must be a positive multiple of num_kv_heads {num_kv_heads}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> PagedLayout {
        PagedLayout::new(16, 32, 32, 16)
    }

    #[test]
    fn slot_translation_div_mod() {
        let l = layout();
        assert_eq!(l.slot_to_physical(0).unwrap(), (0, 0));
        assert_eq!(l.slot_to_physical(15).unwrap(), (0, 15));
        assert_eq!(l.slot_to_physical(16).unwrap(), (1, 0));
        assert_eq!(l.slot_to_physical(250).unwrap(), (15, 10));
    }

    #[test]
    fn slot_round_trips() {
        let l = layout();
        for block in 0..l.num_blocks {
            for offset in 0..l.block_capacity {
                let slot = l.physical_to_slot(block, offset).unwrap();
                assert_eq!(l.slot_to_physical(slot).unwrap(), (block, offset));
            }
        }
    }

    #[test]
    fn out_of_pool_slot_rejected() {
        let l = layout();
        assert!(l.slot_to_physical(l.num_slots()).is_err());
        assert!(l.physical_to_slot(l.num_blocks, 0).is_err());
        assert!(l.physical_to_slot(0, l.block_capacity).is_err());
    }

    #[test]
    fn cell_offset_packing() {
        let l = layout();
        assert_eq!(l.cell_offset(0, 0), 0);
        assert_eq!(l.cell_offset(0, 1), 16);
        assert_eq!(l.cell_offset(1, 0), 512); // one slot = 32 heads * 16
        assert_eq!(l.cell_offset(3, 5), 3 * 512 + 5 * 16);
    }

    #[test]
    fn blocks_needed_rounds_up() {
        let l = layout();
        assert_eq!(l.blocks_needed(0), 0);
        assert_eq!(l.blocks_needed(1), 1);
        assert_eq!(l.blocks_needed(16), 1);
        assert_eq!(l.blocks_needed(17), 2);
        assert_eq!(l.blocks_needed(127), 8);
    }

    #[test]
    fn slot_collision_detected() {
        let l = layout();
        let err = validate_slot_mappings(&[0, 5, 5], &l).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("collision"), "{msg}");
        assert!(msg.contains("token 2"), "{msg}");
    }

    #[test]
    fn slot_bounds_checked() {
        let l = layout();
        assert!(validate_slot_mappings(&[0, 1, 2], &l).is_ok());
        assert!(validate_slot_mappings(&[-1], &l).is_err());
        assert!(validate_slot_mappings(&[512], &l).is_err());
    }

    #[test]
    fn block_table_bounds_checked() {
        let l = layout();
        assert!(validate_block_tables(&[0, 1, 2, 3], 2, 2, &l).is_ok());
        assert!(validate_block_tables(&[0, 1, 2, 32], 2, 2, &l).is_err());
        assert!(validate_block_tables(&[0, 1, 2], 2, 2, &l).is_err());
    }

    #[test]
    fn context_lens_bounded_by_table() {
        let l = layout();
        assert!(validate_context_lens(&[127, 128], 8, &l).is_ok());
        assert!(validate_context_lens(&[129], 8, &l).is_err());
        assert!(validate_context_lens(&[-1], 8, &l).is_err());
    }

    #[test]
    fn head_geometry_checked() {
        assert!(validate_head_geometry(32, 32).is_ok());
        assert!(validate_head_geometry(8, 2).is_ok());
        assert!(validate_head_geometry(6, 4).is_err());
        assert!(validate_head_geometry(0, 1).is_err());
    }

    #[test]
    #[should_panic(expected = "block_capacity must be > 0")]
    fn zero_capacity_panics() {
        PagedLayout::new(0, 1, 1, 1);
    }
}
