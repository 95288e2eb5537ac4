//! Rotary position embedding reference (half-rotation layout).
//!
//! The cos/sin table has shape (max_position, head_size): for each
//! position, `head_size / 2` cosine values followed by `head_size / 2`
//! sine values. Query/key vectors are rotated in place before scoring,
//! matching what the operator applies when `cos_sin_cache` is bound.

use crate::error::{Error, Result};

/// Rotate `data` (num_tokens, num_heads * head_size) in place.
///
/// `positions[t]` selects the cos/sin row for token `t`; `cos_sin` is the
/// flattened (max_position, head_size) table.
///
/// # Errors
/// Returns `Error::Precondition` if a position is outside the table or
/// `head_size` is odd.
pub fn apply_rope(
    data: &mut [f32],
    num_heads: usize,
    head_size: usize,
    positions: &[usize],
    cos_sin: &[f32],
) -> Result<()> {
    if head_size % 2 != 0 {
        return Err(Error::Precondition(format!(
            "rotary embedding requires even head_size, got {head_size}"
        )));
    }
    let half = head_size / 2;
    let max_position = cos_sin.len() / head_size;
    let token_stride = num_heads * head_size;
    if data.len() != positions.len() * token_stride {
        return Err(Error::InvalidShape(format!(
            "rope data len {} != {} tokens * {token_stride}",
            data.len(),
            positions.len()
        )));
    }

    for (t, &pos) in positions.iter().enumerate() {
        if pos >= max_position {
            return Err(Error::Precondition(format!(
                "position {pos} outside cos_sin_cache with {max_position} rows"
            )));
        }
        let cos_row = &cos_sin[pos * head_size..pos * head_size + half];
        let sin_row = &cos_sin[pos * head_size + half..(pos + 1) * head_size];

        for h in 0..num_heads {
            let base = t * token_stride + h * head_size;
            for d in 0..half {
                let x0 = data[base + d];
                let x1 = data[base + half + d];
                data[base + d] = x0 * cos_row[d] - x1 * sin_row[d];
                data[base + half + d] = x1 * cos_row[d] + x0 * sin_row[d];
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rotation_at_cos_one() {
        // cos = 1, sin = 0 leaves vectors untouched.
        let cos_sin = [1.0, 1.0, 0.0, 0.0]; // one position, head_size 4
        let mut data = vec![0.1, 0.2, 0.3, 0.4];
        let orig = data.clone();
        apply_rope(&mut data, 1, 4, &[0], &cos_sin).unwrap();
        assert_eq!(data, orig);
    }

    #[test]
    fn quarter_turn_swaps_halves() {
        // cos = 0, sin = 1 maps (x0, x1) to (-x1, x0).
        let cos_sin = [0.0, 0.0, 1.0, 1.0];
        let mut data = vec![1.0, 2.0, 3.0, 4.0];
        apply_rope(&mut data, 1, 4, &[0], &cos_sin).unwrap();
        assert_eq!(data, vec![-3.0, -4.0, 1.0, 2.0]);
    }

    #[test]
    fn rotation_preserves_norm() {
        let theta: f32 = 0.7;
        let cos_sin = [theta.cos(), theta.cos(), theta.sin(), theta.sin()];
        let mut data = vec![0.3, -0.8, 1.1, 0.25];
        let norm_before: f32 = data.iter().map(|x| x * x).sum();
        apply_rope(&mut data, 1, 4, &[0], &cos_sin).unwrap();
        let norm_after: f32 = data.iter().map(|x| x * x).sum();
        assert!((norm_before - norm_after).abs() < 1e-5);
    }

    #[test]
    fn out_of_table_position_rejected() {
        let cos_sin = [1.0, 1.0, 0.0, 0.0];
        let mut data = vec![0.0; 4];
        let err = apply_rope(&mut data, 1, 4, &[3], &cos_sin).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
