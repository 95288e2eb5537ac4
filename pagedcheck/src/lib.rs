//! Pagedcheck: validation suite for paged key/value attention operators.
//!
//! This crate provides the reference attention computation, the paged
//! cache addressing model, scenario definitions and the oracle that
//! drives them. Operator implementations (CPU, device-backed sessions)
//! live in separate crates behind the [`PagedAttentionOp`] trait.

pub mod attention;
pub mod backend;
pub mod cache;
pub mod dtype;
pub mod error;
pub mod mask;
pub mod oracle;
pub mod paging;
pub mod rope;
pub mod scenario;
pub mod tensor;

pub use attention::{attention_ref, AttentionOptions, ScaleOrder};
pub use backend::{OpAttributes, PagedAttentionOp, Phase, StepInputs};
pub use cache::{
    assemble_decode_inputs, gather_context, verify_cache_writes, DecodeRefInputs, CACHE_ATOL,
};
pub use dtype::{DType, TensorDType};
pub use error::{Error, Result};
pub use mask::{fully_excluded_rows, local_exclusion_mask, Window};
pub use oracle::Oracle;
pub use paging::{
    validate_block_tables, validate_context_lens, validate_head_geometry, validate_slot_mappings,
    PagedLayout,
};
pub use rope::apply_rope;
pub use scenario::Scenario;
pub use tensor::HostTensor;
