//! Local exclusion mask construction for windowed/causal attention.
//!
//! The mask anchors each query row's window at its *effective* diagonal
//! position `i + sk - sq`, where `sk`/`sq` are the valid (non-padding)
//! key/query counts. This keeps the window correct for padded sequences,
//! where the diagonal is shifted relative to the raw grid.

use serde::{Deserialize, Serialize};

/// Attention window bounds relative to the effective diagonal.
///
/// `None` means unbounded on that side. Causal masking is the special
/// case `(left: unbounded, right: 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// How far back a query may look, in key positions.
    pub left: Option<usize>,
    /// How far forward a query may look, in key positions.
    pub right: Option<usize>,
}

impl Window {
    /// Fully unbounded window: no local mask is applied.
    pub const UNBOUNDED: Self = Self {
        left: None,
        right: None,
    };

    /// Causal window: unbounded left, zero right.
    #[must_use]
    pub const fn causal() -> Self {
        Self {
            left: None,
            right: Some(0),
        }
    }

    /// Whether either side is bounded (i.e. a local mask is needed).
    #[must_use]
    pub const fn is_bounded(&self) -> bool {
        self.left.is_some() || self.right.is_some()
    }
}

/// Build a row-major (seqlen_q, seqlen_k) exclusion mask.
///
/// `true` marks a (query, key) pair that attention must exclude.
/// `valid_q` / `valid_k` give the number of valid tokens when the grid
/// contains padding; `None` means the full length is valid.
///
/// With an unbounded left side, column `j` is excluded when
/// `j > i + sk - sq + right`. With a bounded left side the upper bound is
/// additionally clamped to `sk`, and `j < i + sk - sq - left` is excluded.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn local_exclusion_mask(
    seqlen_q: usize,
    seqlen_k: usize,
    window: Window,
    valid_q: Option<usize>,
    valid_k: Option<usize>,
) -> Vec<bool> {
    let sk = valid_k.unwrap_or(seqlen_k) as isize;
    let sq = valid_q.unwrap_or(seqlen_q) as isize;

    let mut mask = vec![false; seqlen_q * seqlen_k];
    if !window.is_bounded() {
        return mask;
    }

    for i in 0..seqlen_q {
        let base = i as isize + sk - sq;
        let row = &mut mask[i * seqlen_k..(i + 1) * seqlen_k];
        for (j, out) in row.iter_mut().enumerate() {
            let col = j as isize;
            *out = match window.left {
                None => match window.right {
                    Some(right) => col > base + right as isize,
                    None => unreachable!("is_bounded checked above"),
                },
                Some(left) => {
                    let hi = match window.right {
                        Some(right) => (base + right as isize).min(sk),
                        None => sk,
                    };
                    col > hi || col < base - left as isize
                }
            };
        }
    }
    mask
}

/// Per-row flags for rows whose every position is excluded.
///
/// Fully excluded rows have no valid attention target; the attention
/// engine must give them all-zero probabilities instead of the NaN that
/// softmax over all `-inf` would produce.
#[must_use]
pub fn fully_excluded_rows(mask: &[bool], seqlen_q: usize, seqlen_k: usize) -> Vec<bool> {
    assert_eq!(mask.len(), seqlen_q * seqlen_k);
    (0..seqlen_q)
        .map(|i| mask[i * seqlen_k..(i + 1) * seqlen_k].iter().all(|&e| e))
        .collect()
}
