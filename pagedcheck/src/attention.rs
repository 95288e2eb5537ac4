//! Reference scaled-dot-product attention engine.
//!
//! Computes the trusted baseline the operator output is compared against:
//! masking (causal, windowed, padding), softmax, optional dropout, and
//! grouped-query head expansion. Grouped-query expansion is pure index
//! arithmetic (`kv_head = head / group_size`); key/value heads are never
//! materialized per query head.

use half::f16;
use rayon::prelude::*;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::mask::{local_exclusion_mask, Window};
use crate::tensor::HostTensor;

/// Which operand absorbs the 1/sqrt(D) factor before the dot product.
///
/// Mathematically equivalent; the choice only perturbs floating-point
/// rounding and exists to characterize that error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOrder {
    /// Scale query elements before the product (the default).
    QueryFirst,
    /// Scale key elements before the product.
    KeyFirst,
}

/// Options for [`attention_ref`].
#[derive(Debug, Clone)]
pub struct AttentionOptions<'a> {
    /// Per-position query validity, row-major (B, Sq). `false` = padding.
    pub query_padding: Option<&'a [bool]>,
    /// Per-position key validity, row-major (B, Sk). `false` = padding.
    pub key_padding: Option<&'a [bool]>,
    /// Dropout probability. Without `dropout_keep` this is a no-op.
    pub dropout_p: f32,
    /// Precomputed keep-mask, row-major (B, Hq, Sq, Sk). `true` = keep.
    pub dropout_keep: Option<&'a [bool]>,
    /// Force the window's right bound to 0.
    pub causal: bool,
    /// Sliding-window bounds around the effective diagonal.
    pub window: Window,
    /// Carry the whole computation in f32, casting back at the end.
    /// When `false` and inputs are f16, intermediate scores and
    /// probabilities are rounded through f16 at each stage boundary to
    /// approximate a native-precision kernel.
    pub upcast: bool,
    /// Scaling placement, see [`ScaleOrder`].
    pub scale_order: ScaleOrder,
}

impl Default for AttentionOptions<'_> {
    fn default() -> Self {
        Self {
            query_padding: None,
            key_padding: None,
            dropout_p: 0.0,
            dropout_keep: None,
            causal: false,
            window: Window::UNBOUNDED,
            upcast: true,
            scale_order: ScaleOrder::QueryFirst,
        }
    }
}

#[inline]
fn narrow(x: f32, to_f16: bool) -> f32 {
    if to_f16 {
        f16::from_f32(x).to_f32()
    } else {
        x
    }
}

fn count_valid(mask: &[bool]) -> usize {
    mask.iter().filter(|&&v| v).count()
}

/// Reference attention over explicit row-major buffers.
///
/// Shapes: `q` (B, Sq, Hq, D), `k`/`v` (B, Sk, Hkv, D) with Hq a positive
/// multiple of Hkv. Returns the output tensor (B, Sq, Hq, D) and the
/// post-masking probability tensor (B, Hq, Sq, Sk), both in the input
/// dtype.
///
/// Fully masked rows produce all-zero probabilities and output, never
/// NaN. Query-padding rows are zeroed in both probabilities and output.
///
/// # Errors
/// Returns `Error::InvalidShape` / `Error::Precondition` on malformed
/// inputs; never panics on well-formed ones.
#[allow(clippy::too_many_lines, clippy::cast_precision_loss)]
pub fn attention_ref(
    q: &HostTensor,
    k: &HostTensor,
    v: &HostTensor,
    opts: &AttentionOptions<'_>,
) -> Result<(HostTensor, HostTensor)> {
    if q.ndim() != 4 || k.ndim() != 4 || v.ndim() != 4 {
        return Err(Error::InvalidShape(format!(
            "attention_ref expects rank-4 q/k/v, got ranks {}/{}/{}",
            q.ndim(),
            k.ndim(),
            v.ndim()
        )));
    }
    if k.shape() != v.shape() {
        return Err(Error::ShapeMismatch {
            expected: k.shape().to_vec(),
            got: v.shape().to_vec(),
        });
    }
    let (b, sq, hq, d) = (q.shape()[0], q.shape()[1], q.shape()[2], q.shape()[3]);
    let (bk, sk, hkv, dk) = (k.shape()[0], k.shape()[1], k.shape()[2], k.shape()[3]);
    if b != bk || d != dk {
        return Err(Error::ShapeMismatch {
            expected: q.shape().to_vec(),
            got: k.shape().to_vec(),
        });
    }
    if hkv == 0 || hq % hkv != 0 {
        return Err(Error::Precondition(format!(
            "num_heads {hq} must be a positive multiple of num_kv_heads {hkv}"
        )));
    }
    if q.dtype() != k.dtype() || q.dtype() != v.dtype() || q.dtype() == DType::I32 {
        return Err(Error::DtypeMismatch {
            expected: q.dtype().to_string(),
            got: format!("{}/{}", k.dtype(), v.dtype()),
        });
    }
    if let Some(qp) = opts.query_padding {
        if qp.len() != b * sq {
            return Err(Error::InvalidShape(format!(
                "query_padding len {} != {}",
                qp.len(),
                b * sq
            )));
        }
    }
    if let Some(kp) = opts.key_padding {
        if kp.len() != b * sk {
            return Err(Error::InvalidShape(format!(
                "key_padding len {} != {}",
                kp.len(),
                b * sk
            )));
        }
    }
    if let Some(keep) = opts.dropout_keep {
        if keep.len() != b * hq * sq * sk {
            return Err(Error::InvalidShape(format!(
                "dropout_keep len {} != {}",
                keep.len(),
                b * hq * sq * sk
            )));
        }
    }
    if !(0.0..1.0).contains(&opts.dropout_p) {
        return Err(Error::Precondition(format!(
            "dropout_p {} outside [0, 1)",
            opts.dropout_p
        )));
    }

    let window = if opts.causal {
        Window {
            left: opts.window.left,
            right: Some(0),
        }
    } else {
        opts.window
    };

    let group = hq / hkv;
    let scale = 1.0 / (d as f32).sqrt();
    let to_f16 = !opts.upcast && q.dtype() == DType::F16;

    let q32 = q.to_f32_vec();
    let k32 = k.to_f32_vec();
    let v32 = v.to_f32_vec();

    // Embarrassingly parallel over batch entries; each produces its own
    // output (Sq, Hq, D) and probability (Hq, Sq, Sk) slab.
    let per_batch: Vec<(Vec<f32>, Vec<f32>)> = (0..b)
        .into_par_iter()
        .map(|bi| {
            let valid_q = opts.query_padding.map(|m| count_valid(&m[bi * sq..(bi + 1) * sq]));
            let valid_k = opts.key_padding.map(|m| count_valid(&m[bi * sk..(bi + 1) * sk]));
            let local = if window.is_bounded() {
                Some(local_exclusion_mask(sq, sk, window, valid_q, valid_k))
            } else {
                None
            };

            let mut out = vec![0.0f32; sq * hq * d];
            let mut probs = vec![0.0f32; hq * sq * sk];
            let mut scores = vec![0.0f32; sk];

            for h in 0..hq {
                let kv_h = h / group;
                for i in 0..sq {
                    let q_off = ((bi * sq + i) * hq + h) * d;
                    let q_vec = &q32[q_off..q_off + d];

                    for (j, score) in scores.iter_mut().enumerate() {
                        let k_off = ((bi * sk + j) * hkv + kv_h) * d;
                        let k_vec = &k32[k_off..k_off + d];
                        let mut dot = 0.0f32;
                        match opts.scale_order {
                            ScaleOrder::QueryFirst => {
                                for dd in 0..d {
                                    dot += narrow(q_vec[dd] * scale, to_f16) * k_vec[dd];
                                }
                            }
                            ScaleOrder::KeyFirst => {
                                for dd in 0..d {
                                    dot += q_vec[dd] * narrow(k_vec[dd] * scale, to_f16);
                                }
                            }
                        }
                        *score = narrow(dot, to_f16);
                    }

                    if let Some(kp) = opts.key_padding {
                        for (j, score) in scores.iter_mut().enumerate() {
                            if !kp[bi * sk + j] {
                                *score = f32::NEG_INFINITY;
                            }
                        }
                    }
                    if let Some(local) = &local {
                        for (j, score) in scores.iter_mut().enumerate() {
                            if local[i * sk + j] {
                                *score = f32::NEG_INFINITY;
                            }
                        }
                    }

                    // Softmax along keys; a fully excluded row gets exact
                    // zeros instead of the NaN softmax would produce.
                    let max_score = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let prow = &mut probs[(h * sq + i) * sk..(h * sq + i + 1) * sk];
                    if max_score == f32::NEG_INFINITY {
                        prow.fill(0.0);
                    } else {
                        let mut sum = 0.0f32;
                        for (p, &s) in prow.iter_mut().zip(scores.iter()) {
                            *p = (s - max_score).exp();
                            sum += *p;
                        }
                        for p in prow.iter_mut() {
                            *p = narrow(*p / sum, to_f16);
                        }
                    }

                    if let Some(qp) = opts.query_padding {
                        if !qp[bi * sq + i] {
                            prow.fill(0.0);
                        }
                    }

                    let keep_scale = 1.0 / (1.0 - opts.dropout_p);
                    let o_off = (i * hq + h) * d;
                    for j in 0..sk {
                        let p = match opts.dropout_keep {
                            Some(keep) => {
                                if keep[((bi * hq + h) * sq + i) * sk + j] {
                                    prow[j] * keep_scale
                                } else {
                                    0.0
                                }
                            }
                            None => prow[j],
                        };
                        if p != 0.0 {
                            let v_off = ((bi * sk + j) * hkv + kv_h) * d;
                            for dd in 0..d {
                                out[o_off + dd] += p * v32[v_off + dd];
                            }
                        }
                    }
                }
            }
            (out, probs)
        })
        .collect();

    let mut out32 = Vec::with_capacity(b * sq * hq * d);
    let mut probs32 = Vec::with_capacity(b * hq * sq * sk);
    for (out_b, probs_b) in per_batch {
        out32.extend_from_slice(&out_b);
        probs32.extend_from_slice(&probs_b);
    }

    let out_shape = [b, sq, hq, d];
    let probs_shape = [b, hq, sq, sk];
    let (out, probs) = match q.dtype() {
        DType::F16 => (
            HostTensor::from_f32_as_f16(&out_shape, &out32),
            HostTensor::from_f32_as_f16(&probs_shape, &probs32),
        ),
        _ => (
            HostTensor::from_f32(&out_shape, &out32),
            HostTensor::from_f32(&probs_shape, &probs32),
        ),
    };
    Ok((out, probs))
}
