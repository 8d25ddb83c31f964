//! # Linear-Chain CRF
//!
//! A tag sequence `y` over emissions `E` scores
//!
//! ```text
//! score(y) = T[START, y0] + Σ_i E[i, y_i] + Σ_i T[y_{i-1}, y_i] + T[y_last, STOP]
//! ```
//!
//! Training maximizes `score(gold) - log Σ_y exp(score(y))`; inference picks
//! `argmax_y score(y)`. Transitions into START, out of STOP, and (when
//! constrained) BIO-illegal pairs are pinned to [`ILLEGAL_SCORE`].
//!
//! Two renditions of the same dynamic program live here:
//! [`lattice`] works on host `f32` slices and backs decoding, and
//! [`layer::CrfLayer`] is the batched, differentiable candle version used
//! for training.

pub mod lattice;
pub mod layer;
pub mod viterbi;

pub use lattice::{TransitionMatrix, allowed_transitions, log_likelihood, log_partition, path_score};
pub use layer::{CrfLayer, Reduction};
pub use viterbi::ViterbiDecoder;

/// Score given to forbidden transitions.
///
/// Finite so that log-sum-exp stays free of `inf - inf`; `exp` of it
/// underflows to zero in `f32`, and no realistic sum of legal scores
/// reaches it.
pub const ILLEGAL_SCORE: f32 = -10000.0;

/// Numerically stable `log Σ exp(x)`.
pub fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f32 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}
