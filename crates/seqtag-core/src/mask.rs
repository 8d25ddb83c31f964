//! # Validity Mask
//!
//! Sequences in a batch are right-padded to the batch maximum. The mask
//! records each row's true length; rows are always true-then-false, so a
//! mask is fully described by its lengths.

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, SeqTagError};

/// Per-row true lengths of a right-padded batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    lengths: Vec<usize>,
    max_len: usize,
}

impl Mask {
    /// Mask whose padded width is the longest row.
    pub fn from_lengths(lengths: Vec<usize>) -> Self {
        let max_len = lengths.iter().copied().max().unwrap_or(0);
        Self { lengths, max_len }
    }

    /// Mask with an explicit padded width.
    pub fn with_max_len(lengths: Vec<usize>, max_len: usize) -> Result<Self> {
        if let Some(&len) = lengths.iter().find(|&&l| l > max_len) {
            return Err(SeqTagError::ShapeMismatch(format!(
                "row length {len} exceeds padded width {max_len}"
            )));
        }
        Ok(Self { lengths, max_len })
    }

    /// Build from boolean rows, rejecting rows with a gap.
    pub fn from_rows(rows: &[Vec<bool>]) -> Result<Self> {
        let max_len = rows.first().map_or(0, Vec::len);
        let mut lengths = Vec::with_capacity(rows.len());
        for (row, values) in rows.iter().enumerate() {
            if values.len() != max_len {
                return Err(SeqTagError::ShapeMismatch(format!(
                    "mask row {row} has width {}, expected {max_len}",
                    values.len()
                )));
            }
            let len = values.iter().take_while(|&&v| v).count();
            if values[len..].iter().any(|&v| v) {
                return Err(SeqTagError::InvalidMask { row });
            }
            lengths.push(len);
        }
        Ok(Self { lengths, max_len })
    }

    /// Build from a `(batch, len)` tensor of 0/1 values.
    pub fn from_tensor(mask: &Tensor) -> Result<Self> {
        let rows: Vec<Vec<u8>> = mask.to_dtype(DType::U8)?.to_vec2()?;
        let rows: Vec<Vec<bool>> = rows
            .into_iter()
            .map(|r| r.into_iter().map(|v| v != 0).collect())
            .collect();
        let (_, width) = mask.dims2()?;
        let mut built = Self::from_rows(&rows)?;
        built.max_len = width;
        Ok(built)
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Padded width of the batch.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// True length of row `row`.
    pub fn len(&self, row: usize) -> usize {
        self.lengths[row]
    }

    /// Whether every row is empty.
    pub fn is_empty(&self) -> bool {
        self.lengths.iter().all(|&l| l == 0)
    }

    /// Number of real tokens across the batch.
    pub fn num_tokens(&self) -> usize {
        self.lengths.iter().sum()
    }

    pub fn is_valid(&self, row: usize, pos: usize) -> bool {
        pos < self.lengths[row]
    }

    /// `(batch, max_len)` tensor with 1 on real tokens and 0 on padding.
    pub fn to_tensor(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let mut data = Vec::with_capacity(self.batch_size() * self.max_len);
        for &len in &self.lengths {
            data.extend((0..self.max_len).map(|pos| u8::from(pos < len)));
        }
        let mask = Tensor::from_vec(data, (self.batch_size(), self.max_len), device)?;
        Ok(mask.to_dtype(dtype)?)
    }

    /// Sub-mask for a single row, padded to the same width.
    pub fn row(&self, row: usize) -> Self {
        Self {
            lengths: vec![self.lengths[row]],
            max_len: self.max_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows() {
        let mask = Mask::from_rows(&[
            vec![true, true, true],
            vec![true, false, false],
            vec![false, false, false],
        ])
        .unwrap();
        assert_eq!(mask.lengths(), &[3, 1, 0]);
        assert_eq!(mask.max_len(), 3);
        assert_eq!(mask.num_tokens(), 4);
        assert!(mask.is_valid(1, 0));
        assert!(!mask.is_valid(1, 1));
    }

    #[test]
    fn test_rejects_gapped_rows() {
        let err = Mask::from_rows(&[vec![true, true], vec![true, false, true]]).unwrap_err();
        assert!(matches!(err, SeqTagError::ShapeMismatch(_)));

        let err = Mask::from_rows(&[vec![true, true, true], vec![true, false, true]]).unwrap_err();
        assert!(matches!(err, SeqTagError::InvalidMask { row: 1 }));
    }

    #[test]
    fn test_tensor_roundtrip() {
        let mask = Mask::with_max_len(vec![2, 4, 0], 5).unwrap();
        let t = mask.to_tensor(DType::U8, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[3, 5]);
        let rows: Vec<Vec<u8>> = t.to_vec2().unwrap();
        assert_eq!(rows[0], vec![1, 1, 0, 0, 0]);
        assert_eq!(rows[2], vec![0, 0, 0, 0, 0]);

        let back = Mask::from_tensor(&t).unwrap();
        assert_eq!(back, mask);
    }

    #[test]
    fn test_with_max_len_bounds() {
        assert!(Mask::with_max_len(vec![3, 6], 5).is_err());
        assert!(Mask::from_lengths(vec![]).is_empty());
    }
}
