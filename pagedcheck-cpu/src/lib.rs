//! CPU implementation of the paged attention operator contract.
//!
//! A straightforward f32 rendition of the operator the suite validates:
//! rotary embedding, slot-mapped cache writes, causal prompt attention
//! and block-table-walking decode attention. All compute is done in f32;
//! f16 enters and leaves only at the tensor boundary, like a device
//! kernel that accumulates in f32.
//!
//! This exists to exercise the oracle end to end, and as the template a
//! device-backed session wrapper would follow.

use half::f16;

use pagedcheck::backend::{OpAttributes, PagedAttentionOp, Phase, StepInputs};
use pagedcheck::paging::PagedLayout;
use pagedcheck::rope::apply_rope;
use pagedcheck::tensor::HostTensor;
use pagedcheck::{Error, Result};

/// Host-resident paged attention operator.
///
/// Caches are loaded from the bound inputs on each `run` call and stay
/// resident afterwards, so `read_back` observes this call's writes.
pub struct CpuPagedAttention {
    attrs: OpAttributes,
    layout: PagedLayout,
    key_cache: Vec<f32>,
    value_cache: Vec<f32>,
}

impl CpuPagedAttention {
    #[must_use]
    pub fn new(attrs: OpAttributes, layout: PagedLayout) -> Self {
        let pool = layout.num_blocks * layout.block_numel();
        Self {
            attrs,
            layout,
            key_cache: vec![0.0; pool],
            value_cache: vec![0.0; pool],
        }
    }

    /// Write one token's K/V vectors to its slot-mapped cell.
    fn write_slot(&mut self, slot: usize, k: &[f32], v: &[f32]) -> Result<()> {
        let (block_idx, block_offset) = self.layout.slot_to_physical(slot)?;
        let stride = self.layout.slot_stride();
        let dst = block_idx * self.layout.block_numel() + block_offset * stride;
        self.key_cache[dst..dst + stride].copy_from_slice(k);
        self.value_cache[dst..dst + stride].copy_from_slice(v);
        Ok(())
    }
}

impl PagedAttentionOp for CpuPagedAttention {
    fn run(&mut self, inputs: &StepInputs<'_>) -> Result<HostTensor> {
        let num_heads = self.attrs.num_heads;
        let num_kv_heads = self.attrs.num_kv_heads;
        let head_size = self.attrs.head_size;
        let gqa_ratio = num_heads / num_kv_heads;
        let scale = self.attrs.resolved_scale();
        let q_stride = num_heads * head_size;
        let kv_stride = self.layout.slot_stride();

        let num_tokens = inputs.query.shape()[0];
        if inputs.query.shape() != [num_tokens, q_stride] {
            return Err(Error::Operator(format!(
                "query shape {:?} does not match {num_heads} heads of {head_size}",
                inputs.query.shape()
            )));
        }

        // Load the bound cache buffers; they stay resident after the call.
        self.key_cache = inputs.key_cache.to_f32_vec();
        self.value_cache = inputs.value_cache.to_f32_vec();

        let mut q32 = inputs.query.to_f32_vec();
        let mut k32 = inputs.key.to_f32_vec();
        let v32 = inputs.value.to_f32_vec();
        let context_lens = inputs.context_lens.as_i32_slice();
        let slot_mappings = inputs.slot_mappings.as_i32_slice();
        let block_tables = inputs.block_tables.as_i32_slice();
        let batch_size = context_lens.len();
        let max_blocks_per_seq = inputs.block_tables.shape()[1];

        if let Some(cos_sin) = inputs.cos_sin_cache {
            let Some(positions) = inputs.positions else {
                return Err(Error::Operator(
                    "cos_sin_cache bound without positions".into(),
                ));
            };
            #[allow(clippy::cast_sign_loss)]
            let positions: Vec<usize> = positions
                .as_i32_slice()
                .iter()
                .map(|&p| p as usize)
                .collect();
            let table = cos_sin.to_f32_vec();
            apply_rope(&mut q32, num_heads, head_size, &positions, &table)?;
            apply_rope(&mut k32, num_kv_heads, head_size, &positions, &table)?;
        }

        // Rotated keys are what lands in the cache.
        for (token_idx, &slot) in slot_mappings.iter().enumerate() {
            let slot = usize::try_from(slot)
                .map_err(|_| Error::Operator(format!("negative slot {slot}")))?;
            let off = token_idx * kv_stride;
            let (k, v) = (
                k32[off..off + kv_stride].to_vec(),
                v32[off..off + kv_stride].to_vec(),
            );
            self.write_slot(slot, &k, &v)?;
        }

        let mut out32 = vec![0.0f32; num_tokens * q_stride];

        match inputs.phase {
            Phase::Prompt => {
                // Each sequence attends causally over its own new tokens;
                // context_lens carries the per-sequence lengths.
                let mut start = 0usize;
                for &len in context_lens {
                    #[allow(clippy::cast_sign_loss)]
                    let len = len as usize;
                    for h in 0..num_heads {
                        let kv_h = h / gqa_ratio;
                        for i in 0..len {
                            let q_off = (start + i) * q_stride + h * head_size;
                            let q_vec = &q32[q_off..q_off + head_size];

                            let mut scores = Vec::with_capacity(i + 1);
                            for j in 0..=i {
                                let k_off = (start + j) * kv_stride + kv_h * head_size;
                                let mut dot = 0.0f32;
                                for d in 0..head_size {
                                    dot += q_vec[d] * k32[k_off + d];
                                }
                                scores.push(dot * scale);
                            }
                            softmax_in_place(&mut scores);

                            let out_off = (start + i) * q_stride + h * head_size;
                            for (j, &p) in scores.iter().enumerate() {
                                let v_off = (start + j) * kv_stride + kv_h * head_size;
                                for d in 0..head_size {
                                    out32[out_off + d] += p * v32[v_off + d];
                                }
                            }
                        }
                    }
                    start += len;
                }
            }
            Phase::Decode => {
                // One query per sequence over ctx cached tokens plus the
                // just-written one, all read back through the block table.
                let cap = self.layout.block_capacity;
                for b in 0..batch_size {
                    #[allow(clippy::cast_sign_loss)]
                    let seq_len = context_lens[b] as usize + 1;
                    let table_row = &block_tables[b * max_blocks_per_seq..]
                        [..max_blocks_per_seq];

                    for h in 0..num_heads {
                        let kv_h = h / gqa_ratio;
                        let q_off = b * q_stride + h * head_size;
                        let q_vec = &q32[q_off..q_off + head_size];

                        let mut scores = Vec::with_capacity(seq_len);
                        for pos in 0..seq_len {
                            #[allow(clippy::cast_sign_loss)]
                            let phys = table_row[pos / cap] as usize;
                            let k_off = (phys * cap + pos % cap) * kv_stride + kv_h * head_size;
                            let mut dot = 0.0f32;
                            for d in 0..head_size {
                                dot += q_vec[d] * self.key_cache[k_off + d];
                            }
                            scores.push(dot * scale);
                        }
                        softmax_in_place(&mut scores);

                        let out_off = b * q_stride + h * head_size;
                        for (pos, &p) in scores.iter().enumerate() {
                            #[allow(clippy::cast_sign_loss)]
                            let phys = table_row[pos / cap] as usize;
                            let v_off = (phys * cap + pos % cap) * kv_stride + kv_h * head_size;
                            for d in 0..head_size {
                                out32[out_off + d] += p * self.value_cache[v_off + d];
                            }
                        }
                    }
                }
            }
        }

        Ok(HostTensor::from_f32_as_f16(
            &[num_tokens, q_stride],
            &out32,
        ))
    }

    fn read_back(&self) -> Result<(HostTensor, HostTensor)> {
        let shape = [self.layout.num_blocks, self.layout.block_numel()];
        Ok((
            HostTensor::from_f32_as_f16(&shape, &self.key_cache),
            HostTensor::from_f32_as_f16(&shape, &self.value_cache),
        ))
    }
}

fn softmax_in_place(scores: &mut [f32]) {
    let max_s = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for s in scores.iter_mut() {
        *s = (*s - max_s).exp();
        sum += *s;
    }
    if sum > 0.0 {
        for s in scores.iter_mut() {
            *s /= sum;
        }
    }
}

/// Build an f16 tensor filled with one value, for tests.
#[must_use]
pub fn full_f16(shape: &[usize], value: f32) -> HostTensor {
    let n: usize = shape.iter().product();
    HostTensor::from_f16(shape, &vec![f16::from_f32(value); n])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagedcheck::DType;

    fn small_op() -> CpuPagedAttention {
        let layout = PagedLayout::new(4, 3, 2, 4);
        let attrs = OpAttributes {
            num_heads: 2,
            num_kv_heads: 2,
            head_size: 4,
            scale: 0.0,
        };
        CpuPagedAttention::new(attrs, layout)
    }

    #[test]
    fn prompt_writes_land_in_mapped_slots() {
        let mut op = small_op();
        let layout = op.layout;
        let stride = layout.slot_stride();

        let key: Vec<f32> = (0..2 * stride).map(|x| x as f32).collect();
        let value: Vec<f32> = (0..2 * stride).map(|x| -(x as f32)).collect();
        let query = HostTensor::from_f32_as_f16(&[2, stride], &vec![0.1; 2 * stride]);
        let key_t = HostTensor::from_f32_as_f16(&[2, stride], &key);
        let value_t = HostTensor::from_f32_as_f16(&[2, stride], &value);
        let cache = HostTensor::zeros(&[layout.num_blocks, layout.block_numel()], DType::F16);
        // Two tokens of one sequence land in block 1, offsets 0 and 1.
        let inputs = StepInputs {
            query: &query,
            key: &key_t,
            value: &value_t,
            key_cache: &cache,
            value_cache: &cache,
            block_tables: &HostTensor::from_i32(&[1, 1], &[1]),
            slot_mappings: &HostTensor::from_i32(&[2], &[4, 5]),
            context_lens: &HostTensor::from_i32(&[1], &[2]),
            phase: Phase::Prompt,
            cos_sin_cache: None,
            positions: None,
        };
        op.run(&inputs).unwrap();

        let base = layout.block_numel(); // block 1
        assert_eq!(op.key_cache[base], 0.0);
        assert_eq!(op.key_cache[base + stride], stride as f32);
        assert_eq!(op.value_cache[base + 1], -1.0);
    }

    #[test]
    fn single_token_prompt_output_equals_value() {
        // With one token, softmax over one score is 1.0 regardless of
        // the key, so attn_out must reproduce the value vector.
        let mut op = small_op();
        let layout = op.layout;
        let stride = layout.slot_stride();

        let value: Vec<f32> = vec![0.25, -0.5, 0.75, 1.0, -1.0, 0.5, -0.25, 0.125];
        let query = full_f16(&[1, stride], 0.3);
        let key_t = full_f16(&[1, stride], 0.7);
        let value_t = HostTensor::from_f32_as_f16(&[1, stride], &value);
        let cache = HostTensor::zeros(&[layout.num_blocks, layout.block_numel()], DType::F16);
        let inputs = StepInputs {
            query: &query,
            key: &key_t,
            value: &value_t,
            key_cache: &cache,
            value_cache: &cache,
            block_tables: &HostTensor::from_i32(&[1, 1], &[0]),
            slot_mappings: &HostTensor::from_i32(&[1], &[0]),
            context_lens: &HostTensor::from_i32(&[1], &[1]),
            phase: Phase::Prompt,
            cos_sin_cache: None,
            positions: None,
        };
        let out = op.run(&inputs).unwrap();
        let out32 = out.to_f32_vec();
        for (a, e) in out32.iter().zip(&value) {
            assert!((a - e).abs() < 1e-3, "{a} vs {e}");
        }
    }

    #[test]
    fn rope_without_positions_rejected() {
        let mut op = small_op();
        let layout = op.layout;
        let stride = layout.slot_stride();
        let query = full_f16(&[1, stride], 0.0);
        let cache = HostTensor::zeros(&[layout.num_blocks, layout.block_numel()], DType::F16);
        let cos_sin = full_f16(&[4, layout.head_size], 1.0);
        let inputs = StepInputs {
            query: &query,
            key: &query,
            value: &query,
            key_cache: &cache,
            value_cache: &cache,
            block_tables: &HostTensor::from_i32(&[1, 1], &[0]),
            slot_mappings: &HostTensor::from_i32(&[1], &[0]),
            context_lens: &HostTensor::from_i32(&[1], &[1]),
            phase: Phase::Prompt,
            cos_sin_cache: Some(&cos_sin),
            positions: None,
        };
        let err = op.run(&inputs).unwrap_err();
        assert!(matches!(err, Error::Operator(_)), "{err}");
    }
}
