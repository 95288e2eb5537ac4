//! Scenario parameter sets.
//!
//! A scenario fixes everything one validation case needs: batch shape,
//! head geometry, pool layout, block tables, slot mappings, phase, and
//! the RNG seed its input tensors are generated from. The canonical
//! constructors reproduce the operator's original qualification cases.

use serde::{Deserialize, Serialize};

use crate::backend::{OpAttributes, Phase};
use crate::error::{Error, Result};
use crate::paging::PagedLayout;

/// Parameters for one validation case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub phase: Phase,
    /// Query tokens per sequence; all 1 in decode phase.
    pub query_lens: Vec<usize>,
    /// Valid cached tokens per sequence at call time; equals the query
    /// length in prompt phase.
    pub context_lens: Vec<i32>,
    /// Query heads (`num_kv_heads` and `head_size` live in `layout`).
    pub num_heads: usize,
    /// Scale attribute handed to the operator; 0.0 selects the default.
    pub scale: f32,
    pub layout: PagedLayout,
    /// Per-sequence physical block assignments, all rows equal length.
    pub block_tables: Vec<Vec<i32>>,
    /// Per-token linear slot indices, sequence-major token order.
    pub slot_mappings: Vec<i32>,
    /// Enable rotary embedding (cos/sin cache + positions inputs).
    pub rotary: bool,
    /// Verify cache writes against the submitted K/V after the call.
    pub check_cache: bool,
    /// Seed for input tensor generation.
    pub seed: u64,
}

impl Scenario {
    /// Number of sequences in the batch.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.query_lens.len()
    }

    /// Total query tokens across the batch.
    #[must_use]
    pub fn num_tokens(&self) -> usize {
        self.query_lens.iter().sum()
    }

    /// Block table row length (uniform across sequences).
    #[must_use]
    pub fn max_blocks_per_seq(&self) -> usize {
        self.block_tables.first().map_or(0, Vec::len)
    }

    /// Row-major flattened block tables.
    #[must_use]
    pub fn flat_block_tables(&self) -> Vec<i32> {
        self.block_tables.iter().flatten().copied().collect()
    }

    /// Operator attributes implied by this scenario.
    #[must_use]
    pub fn attrs(&self) -> OpAttributes {
        OpAttributes {
            num_heads: self.num_heads,
            num_kv_heads: self.layout.num_kv_heads,
            head_size: self.layout.head_size,
            scale: self.scale,
        }
    }

    /// The (sequence, in-sequence position) each token writes at.
    ///
    /// Prompt tokens are sequence-major starting at position 0; a decode
    /// token writes at its sequence's context length.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn token_coordinates(&self) -> Vec<(usize, usize)> {
        let mut coords = Vec::with_capacity(self.num_tokens());
        for (seq_idx, &qlen) in self.query_lens.iter().enumerate() {
            match self.phase {
                Phase::Prompt => coords.extend((0..qlen).map(|pos| (seq_idx, pos))),
                Phase::Decode => coords.push((seq_idx, self.context_lens[seq_idx] as usize)),
            }
        }
        coords
    }

    /// Structural consistency of the parameter set itself.
    ///
    /// # Errors
    /// `Error::Precondition` on the first inconsistency.
    pub fn validate_shape(&self) -> Result<()> {
        let b = self.batch_size();
        if b == 0 {
            return Err(Error::Precondition("empty batch".into()));
        }
        if self.context_lens.len() != b || self.block_tables.len() != b {
            return Err(Error::Precondition(format!(
                "scenario {}: {} query_lens, {} context_lens, {} block table rows",
                self.name,
                b,
                self.context_lens.len(),
                self.block_tables.len()
            )));
        }
        let maxb = self.max_blocks_per_seq();
        if self.block_tables.iter().any(|row| row.len() != maxb) {
            return Err(Error::Precondition(format!(
                "scenario {}: ragged block table rows",
                self.name
            )));
        }
        if self.slot_mappings.len() != self.num_tokens() {
            return Err(Error::Precondition(format!(
                "scenario {}: {} slot mappings for {} tokens",
                self.name,
                self.slot_mappings.len(),
                self.num_tokens()
            )));
        }
        for (seq_idx, (&qlen, &ctx)) in
            self.query_lens.iter().zip(&self.context_lens).enumerate()
        {
            match self.phase {
                Phase::Prompt => {
                    #[allow(clippy::cast_sign_loss)]
                    if ctx < 0 || ctx as usize != qlen {
                        return Err(Error::Precondition(format!(
                            "prompt sequence {seq_idx}: context length {ctx} != query length {qlen}"
                        )));
                    }
                }
                Phase::Decode => {
                    if qlen != 1 {
                        return Err(Error::Precondition(format!(
                            "decode sequence {seq_idx}: query length {qlen} != 1"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // ---- Canonical cases ----

    /// Prompt phase, three sequences of 127 tokens, 32 MHA heads of 16.
    #[must_use]
    pub fn prompt_only() -> Self {
        Self::prompt_base("prompt_only", false, false)
    }

    /// Prompt phase with rotary embedding enabled.
    #[must_use]
    pub fn prompt_rotary() -> Self {
        Self::prompt_base("prompt_rotary", true, false)
    }

    /// Prompt phase plus cache-write verification.
    #[must_use]
    pub fn prompt_cache_check() -> Self {
        Self::prompt_base("prompt_cache_check", false, true)
    }

    /// Decode phase, two sequences with cached contexts of 83 and 65
    /// tokens in 256-token blocks, 6 MHA heads of 16.
    #[must_use]
    pub fn decode_only() -> Self {
        Self::decode_base("decode_only", false, false)
    }

    /// Decode phase with rotary embedding enabled.
    #[must_use]
    pub fn decode_rotary() -> Self {
        Self::decode_base("decode_rotary", true, false)
    }

    /// Decode phase plus cache-write verification.
    #[must_use]
    pub fn decode_cache_check() -> Self {
        Self::decode_base("decode_cache_check", false, true)
    }

    fn prompt_base(name: &str, rotary: bool, check_cache: bool) -> Self {
        // Three 127-token sequences in 16-token blocks: 8 blocks each,
        // slots 0..126, 128..254, 256..382 (the tail slot of each
        // sequence's last block stays free).
        let slot_mappings = (0..127).chain(128..255).chain(256..383).collect();
        Self {
            name: name.into(),
            phase: Phase::Prompt,
            query_lens: vec![127, 127, 127],
            context_lens: vec![127, 127, 127],
            num_heads: 32,
            scale: 0.0,
            layout: PagedLayout::new(16, 32, 32, 16),
            block_tables: vec![
                (0..8).collect(),
                (8..16).collect(),
                (16..24).collect(),
            ],
            slot_mappings,
            rotary,
            check_cache,
            seed: 0x70_61_67_65,
        }
    }

    fn decode_base(name: &str, rotary: bool, check_cache: bool) -> Self {
        // New token positions 83 and 65 land in each sequence's first
        // logical block: slots 2*256+83 and 5*256+65.
        Self {
            name: name.into(),
            phase: Phase::Decode,
            query_lens: vec![1, 1],
            context_lens: vec![83, 65],
            num_heads: 6,
            scale: 0.0,
            layout: PagedLayout::new(256, 6, 6, 16),
            block_tables: vec![vec![2, 4, 1], vec![5, 3, 0]],
            slot_mappings: vec![2 * 256 + 83, 5 * 256 + 65],
            rotary,
            check_cache,
            seed: 0x64_65_63_6f,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_scenarios_are_well_formed() {
        for sc in [
            Scenario::prompt_only(),
            Scenario::prompt_rotary(),
            Scenario::prompt_cache_check(),
            Scenario::decode_only(),
            Scenario::decode_rotary(),
            Scenario::decode_cache_check(),
        ] {
            sc.validate_shape().unwrap_or_else(|e| panic!("{}: {e}", sc.name));
        }
    }

    #[test]
    fn prompt_token_counts() {
        let sc = Scenario::prompt_only();
        assert_eq!(sc.batch_size(), 3);
        assert_eq!(sc.num_tokens(), 381);
        assert_eq!(sc.slot_mappings.len(), 381);
        assert_eq!(sc.max_blocks_per_seq(), 8);
        assert_eq!(sc.attrs().num_heads, 32);
    }

    #[test]
    fn prompt_slots_respect_block_tables() {
        // slot = table[pos / capacity] * capacity + pos % capacity.
        let sc = Scenario::prompt_only();
        let coords = sc.token_coordinates();
        for (token_idx, &slot) in sc.slot_mappings.iter().enumerate() {
            let (seq_idx, pos) = coords[token_idx];
            let cap = sc.layout.block_capacity;
            let expected = sc.block_tables[seq_idx][pos / cap] * cap as i32 + (pos % cap) as i32;
            assert_eq!(slot, expected, "token {token_idx}");
        }
    }

    #[test]
    fn decode_token_coordinates_use_context_lens() {
        let sc = Scenario::decode_only();
        assert_eq!(sc.token_coordinates(), vec![(0, 83), (1, 65)]);
        assert_eq!(sc.slot_mappings, vec![595, 1345]);
    }

    #[test]
    fn ragged_block_tables_rejected() {
        let mut sc = Scenario::decode_only();
        sc.block_tables[1].pop();
        assert!(sc.validate_shape().is_err());
    }

    #[test]
    fn json_round_trip() {
        let sc = Scenario::decode_rotary();
        let json = serde_json::to_string(&sc).unwrap();
        let back: Scenario = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, sc.name);
        assert_eq!(back.slot_mappings, sc.slot_mappings);
        assert_eq!(back.layout, sc.layout);
        assert!(back.rotary);
    }
}
