//! # Sequence Encoder
//!
//! Contextualizes fused token features. Implementations must keep padding
//! from influencing real tokens in either direction.

use candle_core::{DType, Tensor};
use candle_nn::{LSTM, LSTMConfig, RNN, VarBuilder};
use tracing::debug;

use crate::error::{Result, SeqTagError};

/// Maps `(batch, len, in_dim)` features to `(batch, len, output_dim)`.
pub trait SequenceEncoder: Send + Sync {
    fn output_dim(&self) -> usize;

    /// Encode a padded batch; rows past `lengths[b]` are zero in the output.
    fn encode(&self, features: &Tensor, lengths: &[usize], train: bool) -> Result<Tensor>;
}

/// Stacked bidirectional LSTM, `hidden_dim / 2` units per direction.
pub struct BiLstmEncoder {
    layers: Vec<(LSTM, LSTM)>,
    hidden_dim: usize,
}

impl BiLstmEncoder {
    pub fn new(in_dim: usize, hidden_dim: usize, num_layers: usize, vb: VarBuilder) -> Result<Self> {
        if hidden_dim == 0 || hidden_dim % 2 != 0 {
            return Err(SeqTagError::InvalidConfig(format!(
                "bidirectional hidden width must be even, got {hidden_dim}"
            )));
        }
        let half = hidden_dim / 2;
        let mut layers = Vec::with_capacity(num_layers);
        for layer_idx in 0..num_layers {
            let input = if layer_idx == 0 { in_dim } else { hidden_dim };
            let config = LSTMConfig {
                layer_idx,
                ..Default::default()
            };
            let forward = candle_nn::lstm(input, half, config.clone(), vb.pp("forward"))?;
            let backward = candle_nn::lstm(input, half, config, vb.pp("backward"))?;
            layers.push((forward, backward));
        }
        Ok(Self { layers, hidden_dim })
    }

    /// Run one unpadded `(len, dim)` sequence through every layer.
    fn encode_one(&self, xs: Tensor) -> Result<Tensor> {
        let len = xs.dim(0)?;
        let reverse: Vec<u32> = (0..len as u32).rev().collect();
        let reverse = Tensor::from_vec(reverse, len, xs.device())?;

        let mut xs = xs;
        for (forward, backward) in &self.layers {
            let fwd = run(forward, &xs)?;
            let bwd = run(backward, &xs.index_select(&reverse, 0)?)?.index_select(&reverse, 0)?;
            xs = Tensor::cat(&[fwd, bwd], 1)?;
        }
        Ok(xs)
    }
}

fn run(lstm: &LSTM, xs: &Tensor) -> Result<Tensor> {
    let states = lstm.seq(&xs.unsqueeze(0)?)?;
    Ok(lstm.states_to_tensor(&states)?.squeeze(0)?)
}

impl SequenceEncoder for BiLstmEncoder {
    fn output_dim(&self) -> usize {
        self.hidden_dim
    }

    fn encode(&self, features: &Tensor, lengths: &[usize], _train: bool) -> Result<Tensor> {
        let (batch, max_len, _) = features.dims3()?;
        if lengths.len() != batch {
            return Err(SeqTagError::ShapeMismatch(format!(
                "{} lengths for a batch of {batch}",
                lengths.len()
            )));
        }
        let device = features.device();
        let mut rows = Vec::with_capacity(batch);
        for (row, &len) in lengths.iter().enumerate() {
            if len > max_len {
                return Err(SeqTagError::LengthMismatch {
                    sentence: row,
                    expected: max_len,
                    found: len,
                });
            }
            let encoded = if len == 0 {
                Tensor::zeros((max_len, self.hidden_dim), DType::F32, device)?
            } else {
                let hidden = self.encode_one(features.get(row)?.narrow(0, 0, len)?)?;
                if len < max_len {
                    let pad = Tensor::zeros((max_len - len, self.hidden_dim), hidden.dtype(), device)?;
                    Tensor::cat(&[hidden, pad], 0)?
                } else {
                    hidden
                }
            };
            rows.push(encoded);
        }
        debug!(batch, max_len, "bilstm encoded");
        Ok(Tensor::stack(&rows, 0)?)
    }
}
