//! End-to-end scenario runs: oracle vs CPU operator.

use half::f16;

use pagedcheck::{Error, HostTensor, Oracle, PagedAttentionOp, Result, Scenario, StepInputs};
use pagedcheck_cpu::CpuPagedAttention;

fn run(scenario: &Scenario) -> Result<()> {
    let mut op = CpuPagedAttention::new(scenario.attrs(), scenario.layout);
    Oracle::default().run_scenario(scenario, &mut op)
}

#[test]
fn prompt_only_passes() {
    run(&Scenario::prompt_only()).unwrap();
}

#[test]
fn prompt_rotary_passes() {
    run(&Scenario::prompt_rotary()).unwrap();
}

#[test]
fn prompt_cache_check_passes() {
    run(&Scenario::prompt_cache_check()).unwrap();
}

#[test]
fn decode_only_passes() {
    run(&Scenario::decode_only()).unwrap();
}

#[test]
fn decode_rotary_passes() {
    run(&Scenario::decode_rotary()).unwrap();
}

#[test]
fn decode_cache_check_passes() {
    run(&Scenario::decode_cache_check()).unwrap();
}

#[test]
fn gqa_prompt_passes() {
    // 32 query heads over 8 KV heads, otherwise the canonical prompt case.
    let mut sc = Scenario::prompt_only();
    sc.name = "prompt_gqa".into();
    sc.layout.num_kv_heads = 8;
    run(&sc).unwrap();
}

#[test]
fn scenario_survives_json_round_trip() {
    let json = serde_json::to_string(&Scenario::decode_rotary()).unwrap();
    let sc: Scenario = serde_json::from_str(&json).unwrap();
    run(&sc).unwrap();
}

/// Delegates to the real operator, then flips one output element.
struct CorruptedOutput(CpuPagedAttention);

impl PagedAttentionOp for CorruptedOutput {
    fn run(&mut self, inputs: &StepInputs<'_>) -> Result<HostTensor> {
        let out = self.0.run(inputs)?;
        let mut data = out.as_f16_slice().to_vec();
        data[7] = f16::from_f32(f32::from(data[7]) + 1.0);
        Ok(HostTensor::from_f16(out.shape(), &data))
    }

    fn read_back(&self) -> Result<(HostTensor, HostTensor)> {
        self.0.read_back()
    }
}

#[test]
fn corrupted_output_caught_with_coordinates() {
    let sc = Scenario::decode_only();
    let mut op = CorruptedOutput(CpuPagedAttention::new(sc.attrs(), sc.layout));
    let err = Oracle::default().run_scenario(&sc, &mut op).unwrap_err();
    match err {
        Error::OutputMismatch {
            seq_idx,
            token_idx,
            embed_idx,
            ..
        } => {
            assert_eq!(seq_idx, 0);
            assert_eq!(token_idx, 0);
            assert_eq!(embed_idx, 7);
        }
        other => panic!("expected OutputMismatch, got {other}"),
    }
}

/// Delegates to the real operator, then corrupts one cache cell on read-back.
struct CorruptedCache(CpuPagedAttention);

impl PagedAttentionOp for CorruptedCache {
    fn run(&mut self, inputs: &StepInputs<'_>) -> Result<HostTensor> {
        self.0.run(inputs)
    }

    fn read_back(&self) -> Result<(HostTensor, HostTensor)> {
        let (key, value) = self.0.read_back()?;
        let mut data = key.as_f16_slice().to_vec();
        // Slot 595 = block 2, offset 83: the first decode token's cell.
        let layout = Scenario::decode_only().layout;
        let cell = 2 * layout.block_numel() + 83 * layout.slot_stride();
        data[cell] = f16::from_f32(f32::from(data[cell]) + 1.0);
        Ok((HostTensor::from_f16(key.shape(), &data), value))
    }
}

#[test]
fn corrupted_cache_write_caught() {
    let sc = Scenario::decode_cache_check();
    let mut op = CorruptedCache(CpuPagedAttention::new(sc.attrs(), sc.layout));
    let err = Oracle::default().run_scenario(&sc, &mut op).unwrap_err();
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
            assert_eq!(embed_idx, 0);
            assert_eq!(block_idx, 2);
            assert_eq!(block_offset, 83);
        }
        other => panic!("expected CacheMismatch, got {other}"),
    }
}

#[test]
fn wrong_scale_attribute_fails_comparison() {
    let sc = Scenario::decode_only();
    let mut attrs = sc.attrs();
    attrs.scale = 1.0; // operator scores with 1.0 while the oracle expects 1/4
    let mut op = CpuPagedAttention::new(attrs, sc.layout);
    let err = Oracle::default().run_scenario(&sc, &mut op).unwrap_err();
    assert!(matches!(err, Error::OutputMismatch { .. }), "{err}");
}
