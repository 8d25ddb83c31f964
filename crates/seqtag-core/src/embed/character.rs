//! # Character Features
//!
//! Each token's characters are embedded, optionally convolved (kernel 3,
//! same padding, dropout first) and pooled into one vector per token.
//! Padding characters never take part in pooling; a token with no
//! characters pools to zeros.

use candle_core::{D, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Dropout, Embedding, Linear, Module, VarBuilder};

use crate::error::{Result, SeqTagError};
use crate::vocab::PAD_ID;

/// Fill value for masked positions before max or softmax.
const MASKED: f32 = -1e9;

/// How per-character vectors are reduced to one per token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pooling {
    Max,
    Attention,
}

pub struct CharEmbedding {
    table: Embedding,
    conv: Option<(Dropout, Conv1d)>,
    attention: Option<Linear>,
    dim: usize,
}

impl CharEmbedding {
    pub fn new(
        num_chars: usize,
        dim: usize,
        use_cnn: bool,
        pooling: Pooling,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let table = candle_nn::embedding(num_chars, dim, vb.pp("embedding"))?;
        let conv = if use_cnn {
            let config = Conv1dConfig {
                padding: 1,
                ..Default::default()
            };
            let conv = candle_nn::conv1d(dim, dim, 3, config, vb.pp("conv"))?;
            Some((Dropout::new(dropout), conv))
        } else {
            None
        };
        let attention = match pooling {
            Pooling::Attention => Some(candle_nn::linear(dim, 1, vb.pp("attention"))?),
            Pooling::Max => None,
        };
        Ok(Self {
            table,
            conv,
            attention,
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Pool `(batch, len, word_len)` char ids to `(batch, len, dim)`.
    ///
    /// Rank-2 input `(batch, word_len)` is a batch of single tokens and
    /// pools to `(batch, dim)`.
    pub fn forward(&self, char_ids: &Tensor, train: bool) -> Result<Tensor> {
        match char_ids.rank() {
            2 => Ok(self.forward3(&char_ids.unsqueeze(1)?, train)?.squeeze(1)?),
            3 => self.forward3(char_ids, train),
            rank => Err(SeqTagError::ShapeMismatch(format!(
                "char ids must have rank 2 or 3, got {rank}"
            ))),
        }
    }

    fn forward3(&self, char_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, len, width) = char_ids.dims3()?;
        let dim = self.dim;
        let real = char_ids.ne(PAD_ID)?;
        let mut chars = self.table.forward(char_ids)?;

        if let Some((dropout, conv)) = &self.conv {
            // padded cells must look like the convolution's own zero padding
            chars = chars.broadcast_mul(&real.unsqueeze(3)?.to_dtype(chars.dtype())?)?;
            let flat = chars.reshape((batch * len, width, dim))?.transpose(1, 2)?;
            let flat = dropout.forward(&flat.contiguous()?, train)?;
            chars = conv
                .forward(&flat)?
                .transpose(1, 2)?
                .contiguous()?
                .reshape((batch, len, width, dim))?;
        }

        let pooled = match &self.attention {
            None => {
                let keep = real.unsqueeze(3)?.broadcast_as(chars.dims())?;
                let masked = Tensor::full(MASKED, chars.dims(), chars.device())?.to_dtype(chars.dtype())?;
                keep.where_cond(&chars, &masked)?.max(2)?
            }
            Some(score) => {
                let logits = score.forward(&chars)?.squeeze(3)?;
                let masked = Tensor::full(MASKED, logits.dims(), logits.device())?.to_dtype(logits.dtype())?;
                let logits = real.where_cond(&logits, &masked)?;
                let weights = candle_nn::ops::softmax(&logits, D::Minus1)?;
                chars.broadcast_mul(&weights.unsqueeze(3)?)?.sum(2)?
            }
        };

        let any_real = real.max(2)?.unsqueeze(2)?.broadcast_as(pooled.dims())?;
        Ok(any_real.where_cond(&pooled, &pooled.zeros_like()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(use_cnn: bool, pooling: Pooling) -> CharEmbedding {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        CharEmbedding::new(12, 6, use_cnn, pooling, 0.5, vb).unwrap()
    }

    fn ids() -> Tensor {
        // two sentences, two tokens, up to three chars; the last token is padding
        Tensor::new(
            &[[[2u32, 3, 4], [5, 0, 0]], [[6, 7, 0], [0, 0, 0]]],
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_output_shapes() {
        for use_cnn in [false, true] {
            for pooling in [Pooling::Max, Pooling::Attention] {
                let chars = build(use_cnn, pooling);
                let out = chars.forward(&ids(), true).unwrap();
                assert_eq!(out.dims(), &[2, 2, 6]);
            }
        }
    }

    #[test]
    fn test_single_token_input_has_no_spurious_axis() {
        let chars = build(true, Pooling::Max);
        let single = Tensor::new(&[[2u32, 3, 0], [4, 0, 0]], &Device::Cpu).unwrap();
        let out = chars.forward(&single, false).unwrap();
        assert_eq!(out.dims(), &[2, 6]);

        // matches the same tokens laid out as a rank-3 batch
        let as_batch = chars.forward(&single.unsqueeze(1).unwrap(), false).unwrap();
        let diff = out
            .sub(&as_batch.squeeze(1).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_empty_token_pools_to_zero() {
        for pooling in [Pooling::Max, Pooling::Attention] {
            let chars = build(false, pooling);
            let out: Vec<Vec<Vec<f32>>> = chars.forward(&ids(), false).unwrap().to_vec3().unwrap();
            assert!(out[1][1].iter().all(|&v| v == 0.0));
            assert!(out[0][0].iter().any(|&v| v != 0.0));
        }
    }

    #[test]
    fn test_max_pooling_ignores_padding_chars() {
        let chars = build(false, Pooling::Max);
        let padded = Tensor::new(&[[[5u32, 0, 0, 0]]], &Device::Cpu).unwrap();
        let tight = Tensor::new(&[[[5u32]]], &Device::Cpu).unwrap();
        let a: Vec<f32> = chars.forward(&padded, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = chars.forward(&tight, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_convolution_ignores_padding_width() {
        for pooling in [Pooling::Max, Pooling::Attention] {
            let chars = build(true, pooling);
            let padded = Tensor::new(&[[[5u32, 6, 0, 0, 0]]], &Device::Cpu).unwrap();
            let tight = Tensor::new(&[[[5u32, 6]]], &Device::Cpu).unwrap();
            let a = chars.forward(&padded, false).unwrap();
            let b = chars.forward(&tight, false).unwrap();
            let diff = a
                .sub(&b)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-6, "{pooling:?} differs by {diff}");
        }
    }

    #[test]
    fn test_rejects_bad_rank() {
        let chars = build(false, Pooling::Max);
        let flat = Tensor::new(&[1u32, 2], &Device::Cpu).unwrap();
        assert!(chars.forward(&flat, false).is_err());
    }
}
