//! Physical cache buffer assembly and verification.
//!
//! Two directions over the block-structured cache: verify that an
//! operator call wrote every token's K/V vector to the slot-mapped
//! physical cell, and gather a sequence's cached context back into
//! logical per-token order to build decode-phase reference inputs.

use crate::error::{Error, Result};
use crate::paging::PagedLayout;
use crate::tensor::HostTensor;

/// Default absolute tolerance for cache content checks, in the cache's
/// native (f16) precision.
pub const CACHE_ATOL: f32 = 1e-3;

/// Verify operator-written cache contents against the logical vectors.
///
/// `logical` is the (num_tokens, num_kv_heads × head_size) tensor
/// submitted in the call; `cache` is the (num_blocks, block_numel)
/// physical buffer read back afterwards. Every element of every token's
/// flattened vector must sit in the cell addressed through
/// [`PagedLayout`], within `atol`.
///
/// # Errors
/// `Error::CacheMismatch` with full (token, embed, block, offset)
/// coordinates on the first differing element.
pub fn verify_cache_writes(
    tensor_name: &'static str,
    logical: &HostTensor,
    cache: &HostTensor,
    slot_mappings: &[i32],
    layout: &PagedLayout,
    atol: f32,
) -> Result<()> {
    let stride = layout.slot_stride();
    let expected_logical = [slot_mappings.len(), stride];
    if logical.shape() != expected_logical {
        return Err(Error::ShapeMismatch {
            expected: expected_logical.to_vec(),
            got: logical.shape().to_vec(),
        });
    }
    let expected_cache = [layout.num_blocks, layout.block_numel()];
    if cache.shape() != expected_cache {
        return Err(Error::ShapeMismatch {
            expected: expected_cache.to_vec(),
            got: cache.shape().to_vec(),
        });
    }

    let logical32 = logical.to_f32_vec();
    let cache32 = cache.to_f32_vec();

    for (token_idx, &slot) in slot_mappings.iter().enumerate() {
        #[allow(clippy::cast_sign_loss)]
        let (block_idx, block_offset) = layout.slot_to_physical(slot as usize)?;
        let block_base = block_idx * layout.block_numel();
        for head_idx in 0..layout.num_kv_heads {
            let cell = block_base + layout.cell_offset(block_offset, head_idx);
            for d in 0..layout.head_size {
                let embed_idx = head_idx * layout.head_size + d;
                let expected = logical32[token_idx * stride + embed_idx];
                let actual = cache32[cell + d];
                if (expected - actual).abs() > atol {
                    return Err(Error::CacheMismatch {
                        tensor: tensor_name,
                        token_idx,
                        embed_idx,
                        block_idx,
                        block_offset,
                        expected,
                        actual,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Gather the first `len` logical tokens of one sequence from the cache.
///
/// Walks `block_table_row` in order, concatenating each block's valid
/// prefix. Returns `len * slot_stride` f32 values.
///
/// # Errors
/// `Error::Precondition` if `len` overruns the block table or a table
/// entry is outside the pool.
pub fn gather_context(
    cache: &HostTensor,
    block_table_row: &[i32],
    len: usize,
    layout: &PagedLayout,
) -> Result<Vec<f32>> {
    let stride = layout.slot_stride();
    let cache32 = cache.to_f32_vec();
    let mut out = Vec::with_capacity(len * stride);

    for pos in 0..len {
        let logical_block = pos / layout.block_capacity;
        let block_offset = pos % layout.block_capacity;
        let Some(&phys) = block_table_row.get(logical_block) else {
            return Err(Error::Precondition(format!(
                "token position {pos} overruns block table of {} entries",
                block_table_row.len()
            )));
        };
        let phys = usize::try_from(phys).map_err(|_| {
            Error::Precondition(format!("negative block index {phys} in block table"))
        })?;
        if phys >= layout.num_blocks {
            return Err(Error::Precondition(format!(
                "block table references block {phys}, pool has {}",
                layout.num_blocks
            )));
        }
        let src = phys * layout.block_numel() + block_offset * stride;
        out.extend_from_slice(&cache32[src..src + stride]);
    }
    Ok(out)
}

/// Reference K/V inputs assembled for one decode step.
pub struct DecodeRefInputs {
    /// Gathered-plus-spliced keys, (B, seqlen_k, num_kv_heads, head_size) f32.
    pub k: HostTensor,
    /// Gathered-plus-spliced values, same shape.
    pub v: HostTensor,
    /// Row-major (B, seqlen_k) validity mask: `pos < context_len + 1`.
    pub key_padding: Vec<bool>,
    /// Batch-wide key length: `max(context_lens) + 1`.
    pub seqlen_k: usize,
}

/// Assemble decode-phase reference K/V from the cache plus this step's
/// newly submitted vectors.
///
/// Each sequence contributes its first `context_lens[b]` cached tokens
/// followed by the new token's K/V spliced in at position
/// `context_lens[b]`; positions beyond that are zero padding excluded by
/// `key_padding`. `new_k` / `new_v` are the (B, num_kv_heads × head_size)
/// tensors submitted to the operator (post-rotary when rope is active,
/// since that is what lands in the cache).
///
/// # Errors
/// Propagates gather/bounds failures as `Error::Precondition`.
#[allow(clippy::cast_sign_loss)]
pub fn assemble_decode_inputs(
    key_cache: &HostTensor,
    value_cache: &HostTensor,
    block_tables: &[i32],
    max_blocks_per_seq: usize,
    context_lens: &[i32],
    new_k: &HostTensor,
    new_v: &HostTensor,
    layout: &PagedLayout,
) -> Result<DecodeRefInputs> {
    let batch_size = context_lens.len();
    let stride = layout.slot_stride();
    let seqlen_k = context_lens.iter().map(|&c| c as usize).max().unwrap_or(0) + 1;

    let new_k32 = new_k.to_f32_vec();
    let new_v32 = new_v.to_f32_vec();

    let mut k32 = vec![0.0f32; batch_size * seqlen_k * stride];
    let mut v32 = vec![0.0f32; batch_size * seqlen_k * stride];
    let mut key_padding = vec![false; batch_size * seqlen_k];

    for b in 0..batch_size {
        let ctx = context_lens[b] as usize;
        let table_row = &block_tables[b * max_blocks_per_seq..(b + 1) * max_blocks_per_seq];

        let k_ctx = gather_context(key_cache, table_row, ctx, layout)?;
        let v_ctx = gather_context(value_cache, table_row, ctx, layout)?;
        let dst = b * seqlen_k * stride;
        k32[dst..dst + ctx * stride].copy_from_slice(&k_ctx);
        v32[dst..dst + ctx * stride].copy_from_slice(&v_ctx);

        // Splice the not-yet-cached token at its context position.
        let splice = dst + ctx * stride;
        k32[splice..splice + stride].copy_from_slice(&new_k32[b * stride..(b + 1) * stride]);
        v32[splice..splice + stride].copy_from_slice(&new_v32[b * stride..(b + 1) * stride]);

        for pos in 0..=ctx {
            key_padding[b * seqlen_k + pos] = true;
        }
    }

    let shape = [batch_size, seqlen_k, layout.num_kv_heads, layout.head_size];
    Ok(DecodeRefInputs {
        k: HostTensor::from_f32(&shape, &k32),
        v: HostTensor::from_f32(&shape, &v32),
        key_padding,
        seqlen_k,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    fn small_layout() -> PagedLayout {
        // 4 tokens per block, 3 blocks, 2 heads of 2.
        PagedLayout::new(4, 3, 2, 2)
    }

    fn cache_with_token_markers(layout: &PagedLayout) -> HostTensor {
        // Cell (block, offset, e) holds block*100 + offset*10 + e.
        let mut data = vec![f16::ZERO; layout.num_blocks * layout.block_numel()];
        for block in 0..layout.num_blocks {
            for offset in 0..layout.block_capacity {
                for e in 0..layout.slot_stride() {
                    let idx = block * layout.block_numel() + offset * layout.slot_stride() + e;
                    #[allow(clippy::cast_precision_loss)]
                    let val = (block * 100 + offset * 10 + e) as f32;
                    data[idx] = f16::from_f32(val);
                }
            }
        }
        HostTensor::from_f16(&[layout.num_blocks, layout.block_numel()], &data)
    }

    #[test]
    fn verify_accepts_correct_writes() {
        let layout = small_layout();
        let cache = cache_with_token_markers(&layout);
        // Tokens at slots 5 and 9 -> (block 1, offset 1), (block 2, offset 1).
        let slots = [5, 9];
        let logical: Vec<f32> = [(1usize, 1usize), (2, 1)]
            .iter()
            .flat_map(|&(b, o)| (0..4).map(move |e| (b * 100 + o * 10 + e) as f32))
            .collect();
        let logical = HostTensor::from_f32_as_f16(&[2, 4], &logical);
        verify_cache_writes("key", &logical, &cache, &slots, &layout, CACHE_ATOL).unwrap();
    }

    #[test]
    fn verify_reports_coordinates_on_mismatch() {
        let layout = small_layout();
        let cache = cache_with_token_markers(&layout);
        let mut logical: Vec<f32> = (0..4).map(|e| (100 + 10 + e) as f32).collect();
        logical[2] += 5.0; // corrupt embed index 2
        let logical = HostTensor::from_f32_as_f16(&[1, 4], &logical);
        let err =
            verify_cache_writes("key", &logical, &cache, &[5], &layout, CACHE_ATOL).unwrap_err();
        match err {
            Error::CacheMismatch {
                tensor,
                token_idx,
                embed_idx,
                block_idx,
                block_offset,
                ..
            } => {
                assert_eq!(tensor, "key");
                assert_eq!(token_idx, 0);
                assert_eq!(embed_idx, 2);
                assert_eq!(block_idx, 1);
                assert_eq!(block_offset, 1);
            }
            other => panic!("expected CacheMismatch, got {other}"),
        }
    }

    #[test]
    fn gather_walks_block_table_in_order() {
        let layout = small_layout();
        let cache = cache_with_token_markers(&layout);
        // Logical order: block 2 first, then block 0.
        let gathered = gather_context(&cache, &[2, 0], 6, &layout).unwrap();
        assert_eq!(gathered.len(), 6 * 4);
        // Token 0 = (block 2, offset 0), token 4 = (block 0, offset 0).
        assert_eq!(gathered[0], 200.0);
        assert_eq!(gathered[4 * 4], 0.0);
        assert_eq!(gathered[5 * 4], 10.0);
    }

    #[test]
    fn gather_overrun_rejected() {
        let layout = small_layout();
        let cache = cache_with_token_markers(&layout);
        assert!(gather_context(&cache, &[0], 5, &layout).is_err());
        assert!(gather_context(&cache, &[7], 1, &layout).is_err());
    }

    #[test]
    fn decode_assembly_splices_new_token() {
        let layout = small_layout();
        let cache = cache_with_token_markers(&layout);
        let context_lens = [3, 1];
        let tables = [1, 2, 0, 2, 1, 0]; // two rows of three
        let new_k = HostTensor::from_f32_as_f16(&[2, 4], &[9.0; 8]);
        let new_v = HostTensor::from_f32_as_f16(&[2, 4], &[-9.0; 8]);
        let inputs = assemble_decode_inputs(
            &cache,
            &cache,
            &tables,
            3,
            &context_lens,
            &new_k,
            &new_v,
            &layout,
        )
        .unwrap();

        assert_eq!(inputs.seqlen_k, 4);
        assert_eq!(inputs.k.shape(), &[2, 4, 2, 2]);
        let k = inputs.k.as_f32_slice();
        // Sequence 0: positions 0..3 from block 1, splice at position 3.
        assert_eq!(k[0], 100.0);
        assert_eq!(k[3 * 4], 9.0);
        // Sequence 1: position 0 from block 2, splice at 1, padding after.
        assert_eq!(k[4 * 4], 200.0);
        assert_eq!(k[(4 + 1) * 4], 9.0);
        assert_eq!(k[(4 + 2) * 4], 0.0);
        assert_eq!(
            inputs.key_padding,
            vec![true, true, true, true, true, true, false, false]
        );
    }
}
