//! Operator seam: the paged attention kernel as an external collaborator.
//!
//! The suite never looks inside the operator. It hands over one fixed
//! named-tensor input set per call, receives `attn_out`, and can read the
//! operator's resident cache buffers back into host memory. Session
//! creation, library registration and device binding all live behind
//! implementations of [`PagedAttentionOp`].

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tensor::HostTensor;

/// Which batch semantics a call uses. Maps to the wire-level `is_prompt`
/// i32 tensor (1 = prompt, 0 = decode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Full-sequence causal self-attention over newly submitted tokens.
    Prompt,
    /// One new query token per sequence over cached context plus itself.
    Decode,
}

impl Phase {
    /// Wire encoding of the phase flag.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::Prompt => 1,
            Self::Decode => 0,
        }
    }
}

/// Scalar attributes fixed at operator construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OpAttributes {
    /// Query heads.
    pub num_heads: usize,
    /// Key/value heads; `num_heads` must be a positive multiple.
    pub num_kv_heads: usize,
    /// Elements per head.
    pub head_size: usize,
    /// Score scale; `0.0` means "use the default `1/sqrt(head_size)`".
    /// The default-resolution convention is a documented assumption about
    /// the operator, not something the suite verifies independently.
    pub scale: f32,
}

impl OpAttributes {
    /// The scale the operator is assumed to apply.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn resolved_scale(&self) -> f32 {
        if self.scale == 0.0 {
            1.0 / (self.head_size as f32).sqrt()
        } else {
            self.scale
        }
    }
}

/// One call's named-tensor inputs, per the operator contract:
/// `query` (num_tokens, num_heads × head_size) f16,
/// `key`/`value` (num_tokens, num_kv_heads × head_size) f16,
/// `key_cache`/`value_cache` (block_count, capacity × heads × head_size) f16,
/// `block_tables` (batch, max_blocks_per_sequence) i32,
/// `slot_mappings` (num_tokens) i32, `context_lens` (batch) i32,
/// and optionally `cos_sin_cache` (max_position, head_size) f16 with
/// `positions` (num_tokens) i32 to enable rotary embedding.
pub struct StepInputs<'a> {
    pub query: &'a HostTensor,
    pub key: &'a HostTensor,
    pub value: &'a HostTensor,
    pub key_cache: &'a HostTensor,
    pub value_cache: &'a HostTensor,
    pub block_tables: &'a HostTensor,
    pub slot_mappings: &'a HostTensor,
    pub context_lens: &'a HostTensor,
    pub phase: Phase,
    pub cos_sin_cache: Option<&'a HostTensor>,
    pub positions: Option<&'a HostTensor>,
}

/// The external paged attention operator.
///
/// `run` is a single blocking invocation; failures inside it are
/// collaborator errors and propagate unmodified — the suite never
/// retries, since a retry cannot fix a missing capability.
pub trait PagedAttentionOp {
    /// Execute one call, returning `attn_out`
    /// (num_tokens, num_heads × head_size) f16. Updates the operator's
    /// resident key/value caches as a side effect.
    fn run(&mut self, inputs: &StepInputs<'_>) -> Result<HostTensor>;

    /// Read the resident key and value caches back into host memory,
    /// each shaped (block_count, capacity × heads × head_size) f16.
    fn read_back(&self) -> Result<(HostTensor, HostTensor)>;
}
