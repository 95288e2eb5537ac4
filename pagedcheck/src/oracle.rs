//! Scenario orchestration: build inputs, invoke the operator, compute the
//! reference, compare.
//!
//! Every precondition is checked before the operator is invoked; a
//! malformed scenario never reaches the collaborator. Comparison fails
//! fast on the first mismatched element with full coordinates.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::attention::{attention_ref, AttentionOptions};
use crate::backend::{PagedAttentionOp, Phase, StepInputs};
use crate::cache::{assemble_decode_inputs, verify_cache_writes, CACHE_ATOL};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::paging::{
    validate_block_tables, validate_context_lens, validate_head_geometry, validate_slot_mappings,
};
use crate::rope::apply_rope;
use crate::scenario::Scenario;
use crate::tensor::HostTensor;

/// Element-wise agreement thresholds for operator-vs-reference output.
#[derive(Debug, Clone, Copy)]
pub struct Oracle {
    /// Relative tolerance.
    pub rtol: f32,
    /// Absolute tolerance.
    pub atol: f32,
}

impl Default for Oracle {
    fn default() -> Self {
        Self {
            rtol: 1e-3,
            atol: 1e-3,
        }
    }
}

/// Everything one operator call needs, plus the reference-side copies.
struct BuiltInputs {
    query: HostTensor,
    key: HostTensor,
    value: HostTensor,
    key_cache: HostTensor,
    value_cache: HostTensor,
    block_tables: HostTensor,
    slot_mappings: HostTensor,
    context_lens: HostTensor,
    cos_sin_cache: Option<HostTensor>,
    positions: Option<HostTensor>,
    /// Query values the reference scores with: f32, rotated when rotary
    /// is enabled.
    q_ref: Vec<f32>,
    /// Key values the reference scores with, same treatment.
    k_ref: Vec<f32>,
    /// What the operator must have written to the key cache (rotated keys
    /// land in the cache, rounded to its f16 precision).
    expected_key: HostTensor,
    /// What the operator must have written to the value cache.
    expected_value: HostTensor,
}

impl Oracle {
    /// Drive one scenario against an operator implementation.
    ///
    /// # Errors
    /// `Error::Precondition` for malformed scenarios (reported before the
    /// operator is invoked), `Error::OutputMismatch` /
    /// `Error::CacheMismatch` for numeric disagreement, and whatever the
    /// operator itself fails with, propagated unmodified.
    pub fn run_scenario<O: PagedAttentionOp>(
        &self,
        scenario: &Scenario,
        op: &mut O,
    ) -> Result<()> {
        self.validate(scenario)?;
        let built = build_inputs(scenario)?;

        let step = StepInputs {
            query: &built.query,
            key: &built.key,
            value: &built.value,
            key_cache: &built.key_cache,
            value_cache: &built.value_cache,
            block_tables: &built.block_tables,
            slot_mappings: &built.slot_mappings,
            context_lens: &built.context_lens,
            phase: scenario.phase,
            cos_sin_cache: built.cos_sin_cache.as_ref(),
            positions: built.positions.as_ref(),
        };
        let attn_out = op.run(&step)?;

        let reference = self.reference_output(scenario, &built)?;
        self.compare(scenario, &attn_out, &reference)?;

        if scenario.check_cache {
            let (key_cache, value_cache) = op.read_back()?;
            verify_cache_writes(
                "key",
                &built.expected_key,
                &key_cache,
                &scenario.slot_mappings,
                &scenario.layout,
                CACHE_ATOL,
            )?;
            verify_cache_writes(
                "value",
                &built.expected_value,
                &value_cache,
                &scenario.slot_mappings,
                &scenario.layout,
                CACHE_ATOL,
            )?;
        }
        Ok(())
    }

    /// All precondition checks, in one place, before any operator call.
    fn validate(&self, scenario: &Scenario) -> Result<()> {
        scenario.validate_shape()?;
        validate_head_geometry(scenario.num_heads, scenario.layout.num_kv_heads)?;
        let maxb = scenario.max_blocks_per_seq();
        validate_block_tables(
            &scenario.flat_block_tables(),
            scenario.batch_size(),
            maxb,
            &scenario.layout,
        )?;
        validate_context_lens(&scenario.context_lens, maxb, &scenario.layout)?;
        validate_slot_mappings(&scenario.slot_mappings, &scenario.layout)?;

        // Slot mappings must agree with the block tables: the slot a
        // token writes is determined by its (sequence, position) pair.
        let cap = scenario.layout.block_capacity;
        for (token_idx, ((seq_idx, pos), &slot)) in scenario
            .token_coordinates()
            .into_iter()
            .zip(&scenario.slot_mappings)
            .enumerate()
        {
            let logical_block = pos / cap;
            if logical_block >= maxb {
                return Err(Error::Precondition(format!(
                    "token {token_idx} at position {pos} overruns sequence {seq_idx}'s \
                     block table"
                )));
            }
            #[allow(clippy::cast_sign_loss)]
            let expected =
                scenario.block_tables[seq_idx][logical_block] as usize * cap + pos % cap;
            #[allow(clippy::cast_sign_loss)]
            if slot as usize != expected {
                return Err(Error::Precondition(format!(
                    "slot mapping {slot} for token {token_idx} disagrees with block table \
                     (sequence {seq_idx}, position {pos} maps to slot {expected})"
                )));
            }
        }
        Ok(())
    }

    /// Trusted baseline for the whole batch, flattened
    /// (num_tokens, num_heads × head_size) f32.
    fn reference_output(&self, scenario: &Scenario, built: &BuiltInputs) -> Result<Vec<f32>> {
        let d = scenario.layout.head_size;
        let hq = scenario.num_heads;
        let hkv = scenario.layout.num_kv_heads;
        let q_cols = hq * d;
        let kv_cols = hkv * d;

        match scenario.phase {
            Phase::Prompt => {
                // Each sequence is a full causal self-attention problem
                // over exactly the tokens submitted in this call.
                let value32 = built.value.to_f32_vec();
                let mut out = Vec::with_capacity(scenario.num_tokens() * q_cols);
                let mut tok0 = 0usize;
                for &len in &scenario.query_lens {
                    let q_b = HostTensor::from_f32(
                        &[1, len, hq, d],
                        &built.q_ref[tok0 * q_cols..(tok0 + len) * q_cols],
                    );
                    let k_b = HostTensor::from_f32(
                        &[1, len, hkv, d],
                        &built.k_ref[tok0 * kv_cols..(tok0 + len) * kv_cols],
                    );
                    let v_b = HostTensor::from_f32(
                        &[1, len, hkv, d],
                        &value32[tok0 * kv_cols..(tok0 + len) * kv_cols],
                    );
                    let opts = AttentionOptions {
                        causal: true,
                        ..Default::default()
                    };
                    let (o, _) = attention_ref(&q_b, &k_b, &v_b, &opts)?;
                    out.extend_from_slice(o.as_f32_slice());
                    tok0 += len;
                }
                Ok(out)
            }
            Phase::Decode => {
                // Gathered cached context plus the new token, spliced at
                // each sequence's context length. The spliced key carries
                // the cache's f16 rounding, matching what the operator
                // actually reads back out of its pages.
                let dec = assemble_decode_inputs(
                    &built.key_cache,
                    &built.value_cache,
                    &scenario.flat_block_tables(),
                    scenario.max_blocks_per_seq(),
                    &scenario.context_lens,
                    &built.expected_key,
                    &built.value,
                    &scenario.layout,
                )?;
                let q = HostTensor::from_f32(
                    &[scenario.batch_size(), 1, hq, d],
                    &built.q_ref,
                );
                let opts = AttentionOptions {
                    causal: true,
                    key_padding: Some(&dec.key_padding),
                    ..Default::default()
                };
                let (o, _) = attention_ref(&q, &dec.k, &dec.v, &opts)?;
                Ok(o.as_f32_slice().to_vec())
            }
        }
    }

    /// Element-wise comparison with NaN-equals-NaN semantics, failing
    /// fast on the first disagreement.
    fn compare(
        &self,
        scenario: &Scenario,
        attn_out: &HostTensor,
        reference: &[f32],
    ) -> Result<()> {
        let q_cols = scenario.num_heads * scenario.layout.head_size;
        let expected_shape = [scenario.num_tokens(), q_cols];
        if attn_out.shape() != expected_shape {
            return Err(Error::ShapeMismatch {
                expected: expected_shape.to_vec(),
                got: attn_out.shape().to_vec(),
            });
        }
        if attn_out.dtype() != DType::F16 {
            return Err(Error::DtypeMismatch {
                expected: DType::F16.to_string(),
                got: attn_out.dtype().to_string(),
            });
        }

        let actual = attn_out.to_f32_vec();
        let coords = scenario.token_coordinates();
        for (token_idx, &(seq_idx, _)) in coords.iter().enumerate() {
            for embed_idx in 0..q_cols {
                let a = actual[token_idx * q_cols + embed_idx];
                let r = reference[token_idx * q_cols + embed_idx];
                if a.is_nan() && r.is_nan() {
                    continue;
                }
                if !((a - r).abs() <= self.atol + self.rtol * r.abs()) {
                    return Err(Error::OutputMismatch {
                        seq_idx,
                        token_idx,
                        embed_idx,
                        expected: r,
                        actual: a,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Generate all call tensors from the scenario's seed.
///
/// Payload tensors are uniform in [-1, 1) rounded to f16, like the
/// operator would receive in production. Prompt-phase caches start
/// zeroed; decode-phase caches start with random resident context.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn build_inputs(scenario: &Scenario) -> Result<BuiltInputs> {
    let mut rng = StdRng::seed_from_u64(scenario.seed);
    let mut uniform = |n: usize| -> Vec<f32> {
        (0..n).map(|_| rng.gen::<f32>().mul_add(2.0, -1.0)).collect()
    };

    let t = scenario.num_tokens();
    let b = scenario.batch_size();
    let d = scenario.layout.head_size;
    let q_cols = scenario.num_heads * d;
    let kv_cols = scenario.layout.slot_stride();

    let query = HostTensor::from_f32_as_f16(&[t, q_cols], &uniform(t * q_cols));
    let key = HostTensor::from_f32_as_f16(&[t, kv_cols], &uniform(t * kv_cols));
    let value = HostTensor::from_f32_as_f16(&[t, kv_cols], &uniform(t * kv_cols));

    let cache_shape = [scenario.layout.num_blocks, scenario.layout.block_numel()];
    let (key_cache, value_cache) = match scenario.phase {
        Phase::Prompt => (
            HostTensor::zeros(&cache_shape, DType::F16),
            HostTensor::zeros(&cache_shape, DType::F16),
        ),
        Phase::Decode => {
            let n = cache_shape[0] * cache_shape[1];
            (
                HostTensor::from_f32_as_f16(&cache_shape, &uniform(n)),
                HostTensor::from_f32_as_f16(&cache_shape, &uniform(n)),
            )
        }
    };

    let block_tables = HostTensor::from_i32(
        &[b, scenario.max_blocks_per_seq()],
        &scenario.flat_block_tables(),
    );
    let slot_mappings = HostTensor::from_i32(&[t], &scenario.slot_mappings);
    let context_lens = HostTensor::from_i32(&[b], &scenario.context_lens);

    let token_positions: Vec<usize> = scenario
        .token_coordinates()
        .into_iter()
        .map(|(_, pos)| pos)
        .collect();

    let mut q_ref = query.to_f32_vec();
    let mut k_ref = key.to_f32_vec();
    let (cos_sin_cache, positions) = if scenario.rotary {
        let max_position = token_positions.iter().max().copied().unwrap_or(0) + 1;
        let table = HostTensor::from_f32_as_f16(&[max_position, d], &uniform(max_position * d));
        let table32 = table.to_f32_vec();
        apply_rope(&mut q_ref, scenario.num_heads, d, &token_positions, &table32)?;
        apply_rope(
            &mut k_ref,
            scenario.layout.num_kv_heads,
            d,
            &token_positions,
            &table32,
        )?;
        let pos_i32: Vec<i32> = token_positions.iter().map(|&p| p as i32).collect();
        (Some(table), Some(HostTensor::from_i32(&[t], &pos_i32)))
    } else {
        (None, None)
    };

    let expected_key = HostTensor::from_f32_as_f16(&[t, kv_cols], &k_ref);
    let expected_value = value.clone();

    Ok(BuiltInputs {
        query,
        key,
        value,
        key_cache,
        value_cache,
        block_tables,
        slot_mappings,
        context_lens,
        cos_sin_cache,
        positions,
        q_ref,
        k_ref,
        expected_key,
        expected_value,
    })
}
