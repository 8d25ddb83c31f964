//! Word lookup table.

use candle_core::Tensor;
use candle_nn::{Embedding, Init, Module, VarBuilder};

use crate::error::{Result, SeqTagError};

/// Parameter name of the table under its builder prefix.
pub const WEIGHT: &str = "weight";

/// `(vocab, dim)` word embedding table.
pub struct WordEmbedding {
    table: Embedding,
    vocab_size: usize,
    dim: usize,
    frozen: bool,
}

impl WordEmbedding {
    /// A randomly initialised table registered under `vb`.
    ///
    /// A pretrained table is installed afterwards by overwriting the
    /// registered variable, so the same path serves both cases.
    pub fn new(vocab_size: usize, dim: usize, frozen: bool, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (vocab_size, dim),
            WEIGHT,
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Ok(Self {
            table: Embedding::new(weight, dim),
            vocab_size,
            dim,
            frozen,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Whether the optimizer should leave this table alone.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// `(batch, len)` ids to `(batch, len, dim)` vectors.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let embedded = self.table.forward(ids)?;
        if self.frozen {
            Ok(embedded.detach())
        } else {
            Ok(embedded)
        }
    }

    /// Check a pretrained table against this one's shape.
    pub fn check_table(&self, table: &Tensor) -> Result<()> {
        let (rows, cols) = table.dims2()?;
        if rows != self.vocab_size {
            return Err(SeqTagError::VocabMismatch {
                what: "word vocabulary",
                expected: self.vocab_size,
                found: rows,
            });
        }
        if cols != self.dim {
            return Err(SeqTagError::ShapeMismatch(format!(
                "pretrained table has width {cols}, model expects {}",
                self.dim
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_lookup_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let words = WordEmbedding::new(10, 4, false, vb.pp("word")).unwrap();
        let ids = Tensor::new(&[[2u32, 3, 0], [1, 0, 0]], &Device::Cpu).unwrap();
        assert_eq!(words.forward(&ids).unwrap().dims(), &[2, 3, 4]);
        assert!(varmap.data().lock().unwrap().contains_key("word.weight"));
    }

    #[test]
    fn test_check_table() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let words = WordEmbedding::new(10, 4, true, vb).unwrap();
        let ok = Tensor::zeros((10, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(words.check_table(&ok).is_ok());
        let short = Tensor::zeros((9, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            words.check_table(&short),
            Err(SeqTagError::VocabMismatch { expected: 10, found: 9, .. })
        ));
    }
}
