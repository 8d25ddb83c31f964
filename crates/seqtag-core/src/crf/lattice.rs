//! Host-side CRF scoring over a single sequence.
//!
//! Emissions are row-major `len × num_tags` slices. An empty sequence
//! scores `0` and has log-partition `0`, so its log-likelihood is `0`.

use serde::{Deserialize, Serialize};

use super::{ILLEGAL_SCORE, log_sum_exp};
use crate::error::{Result, SeqTagError};
use crate::vocab::TagVocab;

/// Row-major legality table over the `(T+2) × (T+2)` state space.
pub fn allowed_transitions(tags: &TagVocab, bio: bool) -> Vec<bool> {
    let n = tags.num_states();
    (0..n * n)
        .map(|i| tags.is_valid_transition(i / n, i % n, bio))
        .collect()
}

/// Transition scores over real tags plus START (`num_tags`) and STOP (`num_tags + 1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionMatrix {
    num_tags: usize,
    scores: Vec<f32>,
}

impl TransitionMatrix {
    /// All legal entries zero, illegal entries pinned.
    pub fn zeros(tags: &TagVocab, bio: bool) -> Self {
        let scores = allowed_transitions(tags, bio)
            .into_iter()
            .map(|ok| if ok { 0.0 } else { ILLEGAL_SCORE })
            .collect();
        Self {
            num_tags: tags.len(),
            scores,
        }
    }

    /// Wrap raw row-major scores of size `(num_tags + 2)²`.
    pub fn from_scores(num_tags: usize, scores: Vec<f32>) -> Result<Self> {
        let n = num_tags + 2;
        if scores.len() != n * n {
            return Err(SeqTagError::ShapeMismatch(format!(
                "transition matrix for {num_tags} tags needs {} entries, got {}",
                n * n,
                scores.len()
            )));
        }
        Ok(Self { num_tags, scores })
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn start_index(&self) -> usize {
        self.num_tags
    }

    pub fn stop_index(&self) -> usize {
        self.num_tags + 1
    }

    fn width(&self) -> usize {
        self.num_tags + 2
    }

    pub fn get(&self, from: usize, to: usize) -> f32 {
        self.scores[from * self.width() + to]
    }

    pub fn set(&mut self, from: usize, to: usize, score: f32) {
        let w = self.width();
        self.scores[from * w + to] = score;
    }

    /// Score of START -> `to`.
    pub fn start(&self, to: usize) -> f32 {
        self.get(self.start_index(), to)
    }

    /// Score of `from` -> STOP.
    pub fn stop(&self, from: usize) -> f32 {
        self.get(from, self.stop_index())
    }

    /// Re-pin every entry the legality table forbids.
    pub fn constrain(&mut self, allowed: &[bool]) {
        for (score, &ok) in self.scores.iter_mut().zip(allowed) {
            if !ok {
                *score = ILLEGAL_SCORE;
            }
        }
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    /// Number of rows in a flat emission slice, checking it divides evenly.
    pub(crate) fn rows(&self, emissions: &[f32]) -> Result<usize> {
        if self.num_tags == 0 || emissions.len() % self.num_tags != 0 {
            return Err(SeqTagError::ShapeMismatch(format!(
                "{} emission scores do not form rows of {} tags",
                emissions.len(),
                self.num_tags
            )));
        }
        Ok(emissions.len() / self.num_tags)
    }
}

/// Score of one tag path: boundaries, emissions and pairwise transitions.
pub fn path_score(emissions: &[f32], tags: &[usize], trans: &TransitionMatrix) -> Result<f32> {
    let len = trans.rows(emissions)?;
    if tags.len() != len {
        return Err(SeqTagError::LengthMismatch {
            sentence: 0,
            expected: len,
            found: tags.len(),
        });
    }
    let t = trans.num_tags();
    if let Some(&bad) = tags.iter().find(|&&tag| tag >= t) {
        return Err(SeqTagError::UnknownTag(format!("index {bad}")));
    }
    let (Some(&first), Some(&last)) = (tags.first(), tags.last()) else {
        return Ok(0.0);
    };

    let mut score = trans.start(first) + trans.stop(last);
    for (pos, &tag) in tags.iter().enumerate() {
        score += emissions[pos * t + tag];
        if pos > 0 {
            score += trans.get(tags[pos - 1], tag);
        }
    }
    Ok(score)
}

/// Log-partition over every tag path of the sequence (forward algorithm).
pub fn log_partition(emissions: &[f32], trans: &TransitionMatrix) -> Result<f32> {
    let len = trans.rows(emissions)?;
    if len == 0 {
        return Ok(0.0);
    }
    let t = trans.num_tags();

    let mut alpha: Vec<f32> = (0..t).map(|tag| trans.start(tag) + emissions[tag]).collect();
    let mut next = vec![0.0f32; t];
    let mut terms = vec![0.0f32; t];
    for pos in 1..len {
        for (tag, slot) in next.iter_mut().enumerate() {
            for (prev, term) in terms.iter_mut().enumerate() {
                *term = alpha[prev] + trans.get(prev, tag);
            }
            *slot = log_sum_exp(&terms) + emissions[pos * t + tag];
        }
        std::mem::swap(&mut alpha, &mut next);
    }

    for (tag, a) in alpha.iter_mut().enumerate() {
        *a += trans.stop(tag);
    }
    Ok(log_sum_exp(&alpha))
}

/// `log P(tags | emissions)`.
pub fn log_likelihood(emissions: &[f32], tags: &[usize], trans: &TransitionMatrix) -> Result<f32> {
    Ok(path_score(emissions, tags, trans)? - log_partition(emissions, trans)?)
}
