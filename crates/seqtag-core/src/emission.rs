//! Per-token projection from encoder width to tag scores.

use candle_core::Tensor;
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use crate::error::Result;

pub struct EmissionScorer {
    projection: Linear,
    dropout: Dropout,
    num_tags: usize,
}

impl EmissionScorer {
    pub fn new(hidden_dim: usize, num_tags: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            projection: candle_nn::linear(hidden_dim, num_tags, vb)?,
            dropout: Dropout::new(dropout),
            num_tags,
        })
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    /// `(batch, len, hidden)` to `(batch, len, num_tags)`; dropout only when training.
    pub fn forward(&self, hidden: &Tensor, train: bool) -> Result<Tensor> {
        let scores = self.projection.forward(hidden)?;
        Ok(self.dropout.forward(&scores, train)?)
    }
}
