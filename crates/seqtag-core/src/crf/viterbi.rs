//! # Viterbi Decoding for CRF
//!
//! Finds the highest-scoring tag path under a [`TransitionMatrix`],
//! including the START and STOP boundary transitions.

use rayon::prelude::*;

use super::lattice::TransitionMatrix;
use crate::error::Result;

/// Viterbi decoder for CRF tag sequences.
#[derive(Debug, Clone, Default)]
pub struct ViterbiDecoder;

/// Path score and backpointer for one lattice cell.
#[derive(Debug, Clone, Copy)]
struct PathState {
    score: f32,
    prev_tag: usize,
}

impl ViterbiDecoder {
    /// Create a new Viterbi decoder.
    pub fn new() -> Self {
        Self
    }

    /// Decode the optimal tag sequence.
    ///
    /// # Arguments
    /// * `emissions` - Row-major `[seq_len, num_tags]` emission scores
    /// * `trans` - Transition scores including START/STOP
    ///
    /// # Returns
    /// One tag index per row. Ties go to the lowest tag index.
    pub fn decode(&self, emissions: &[f32], trans: &TransitionMatrix) -> Result<Vec<usize>> {
        Ok(self.decode_with_score(emissions, trans)?.0)
    }

    /// Decode and also return the score of the winning path.
    pub fn decode_with_score(
        &self,
        emissions: &[f32],
        trans: &TransitionMatrix,
    ) -> Result<(Vec<usize>, f32)> {
        let seq_len = trans.rows(emissions)?;
        if seq_len == 0 {
            return Ok((Vec::new(), 0.0));
        }
        let num_tags = trans.num_tags();

        let mut dp: Vec<Vec<PathState>> = Vec::with_capacity(seq_len);
        dp.push(
            (0..num_tags)
                .map(|tag| PathState {
                    score: trans.start(tag) + emissions[tag],
                    prev_tag: trans.start_index(),
                })
                .collect(),
        );

        for pos in 1..seq_len {
            let prev_row = &dp[pos - 1];
            let row = (0..num_tags)
                .map(|curr_tag| {
                    let mut best = PathState {
                        score: f32::NEG_INFINITY,
                        prev_tag: 0,
                    };
                    for (prev_tag, prev) in prev_row.iter().enumerate() {
                        let score = prev.score + trans.get(prev_tag, curr_tag);
                        // strict comparison keeps the lowest index on ties
                        if score > best.score {
                            best = PathState { score, prev_tag };
                        }
                    }
                    best.score += emissions[pos * num_tags + curr_tag];
                    best
                })
                .collect();
            dp.push(row);
        }

        let mut best_final_tag = 0;
        let mut best_final_score = f32::NEG_INFINITY;
        for (tag, state) in dp[seq_len - 1].iter().enumerate() {
            let score = state.score + trans.stop(tag);
            if score > best_final_score {
                best_final_score = score;
                best_final_tag = tag;
            }
        }

        let mut path = Vec::with_capacity(seq_len);
        let mut curr_tag = best_final_tag;
        path.push(curr_tag);
        for pos in (1..seq_len).rev() {
            curr_tag = dp[pos][curr_tag].prev_tag;
            path.push(curr_tag);
        }
        path.reverse();

        debug_assert!(
            path.iter().all(|&tag| tag < num_tags),
            "sentinel state decoded: {path:?}"
        );
        Ok((path, best_final_score))
    }

    /// Decode a batch of independent sequences in parallel.
    ///
    /// Each entry is a row-major `[len_i, num_tags]` slice; an empty slice
    /// decodes to an empty path.
    pub fn decode_batch<E>(&self, emissions: &[E], trans: &TransitionMatrix) -> Result<Vec<Vec<usize>>>
    where
        E: AsRef<[f32]> + Sync,
    {
        emissions
            .par_iter()
            .map(|e| self.decode(e.as_ref(), trans))
            .collect()
    }
}
