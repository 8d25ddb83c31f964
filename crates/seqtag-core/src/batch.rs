//! # Batch Preparation
//!
//! Turns raw token sequences into right-padded id tensors plus a [`Mask`].
//! A batch remembers which feature sources it was prepared for so the
//! embedder can refuse a batch built for a different model.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::config::{FeatureLayout, FeatureSource};
use crate::error::{Result, SeqTagError};
use crate::mask::Mask;
use crate::vocab::{PAD_ID, Vocabulary};

/// A padded batch of sentences.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Feature sources the batch carries inputs for, in layout order.
    pub features: Vec<FeatureSource>,
    /// Raw tokens, one list per sentence.
    pub text: Vec<Vec<String>>,
    /// `(batch, max_len)` word ids, present when words are a source.
    pub word_ids: Option<Tensor>,
    /// `(batch, max_len, max_word_len)` char ids, present when chars are a source.
    pub char_ids: Option<Tensor>,
    pub mask: Mask,
    /// Gold tag indices, one list per sentence.
    pub gold: Option<Vec<Vec<usize>>>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.mask.batch_size()
    }

    pub fn max_len(&self) -> usize {
        self.mask.max_len()
    }

    pub fn lengths(&self) -> &[usize] {
        self.mask.lengths()
    }

    /// Gold tags, or an error for an unlabelled batch.
    pub fn gold(&self) -> Result<&[Vec<usize>]> {
        self.gold
            .as_deref()
            .ok_or_else(|| SeqTagError::ShapeMismatch("batch carries no gold tags".into()))
    }
}

/// Encodes sentences for one model's feature layout.
#[derive(Debug, Clone)]
pub struct BatchEncoder {
    vocab: Arc<Vocabulary>,
    features: Vec<FeatureSource>,
    max_sequence_length: usize,
    device: Device,
}

impl BatchEncoder {
    pub fn new(
        vocab: Arc<Vocabulary>,
        layout: &FeatureLayout,
        max_sequence_length: usize,
        device: &Device,
    ) -> Self {
        Self {
            vocab,
            features: layout.sources().iter().map(|(s, _)| *s).collect(),
            max_sequence_length,
            device: device.clone(),
        }
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Encode unlabelled sentences.
    pub fn encode<S: AsRef<str>>(&self, sentences: &[Vec<S>]) -> Result<Batch> {
        let text: Vec<Vec<String>> = sentences
            .iter()
            .map(|s| s.iter().map(|t| t.as_ref().to_string()).collect())
            .collect();
        for sentence in &text {
            if sentence.len() > self.max_sequence_length {
                return Err(SeqTagError::SequenceTooLong {
                    length: sentence.len(),
                    max: self.max_sequence_length,
                });
            }
        }

        let mask = Mask::from_lengths(text.iter().map(Vec::len).collect());
        let word_ids = if self.features.contains(&FeatureSource::Word) {
            Some(self.word_tensor(&text, &mask)?)
        } else {
            None
        };
        let char_ids = if self.features.contains(&FeatureSource::Char) {
            Some(self.char_tensor(&text, &mask)?)
        } else {
            None
        };
        debug!(
            batch = mask.batch_size(),
            max_len = mask.max_len(),
            "encoded batch"
        );

        Ok(Batch {
            features: self.features.clone(),
            text,
            word_ids,
            char_ids,
            mask,
            gold: None,
        })
    }

    /// Encode sentences together with their tag labels.
    pub fn encode_tagged<S, T>(&self, sentences: &[Vec<S>], tags: &[Vec<T>]) -> Result<Batch>
    where
        S: AsRef<str>,
        T: AsRef<str>,
    {
        if sentences.len() != tags.len() {
            return Err(SeqTagError::ShapeMismatch(format!(
                "{} sentences but {} tag sequences",
                sentences.len(),
                tags.len()
            )));
        }
        let mut batch = self.encode(sentences)?;
        let mut gold = Vec::with_capacity(tags.len());
        for (sentence, (tokens, labels)) in sentences.iter().zip(tags).enumerate() {
            if tokens.len() != labels.len() {
                return Err(SeqTagError::LengthMismatch {
                    sentence,
                    expected: tokens.len(),
                    found: labels.len(),
                });
            }
            gold.push(self.vocab.tags.encode(labels)?);
        }
        batch.gold = Some(gold);
        Ok(batch)
    }

    fn word_tensor(&self, text: &[Vec<String>], mask: &Mask) -> Result<Tensor> {
        let max_len = mask.max_len();
        let mut ids = vec![PAD_ID; text.len() * max_len];
        for (row, sentence) in text.iter().enumerate() {
            for (pos, word) in sentence.iter().enumerate() {
                ids[row * max_len + pos] = self.vocab.word_id(word);
            }
        }
        Ok(Tensor::from_vec(ids, (text.len(), max_len), &self.device)?)
    }

    fn char_tensor(&self, text: &[Vec<String>], mask: &Mask) -> Result<Tensor> {
        let max_len = mask.max_len();
        let encoded: Vec<Vec<Vec<u32>>> = text
            .iter()
            .map(|s| s.iter().map(|w| self.vocab.char_ids(w)).collect())
            .collect();
        // at least one column so pooling always has an axis to reduce
        let width = encoded
            .iter()
            .flatten()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
            .max(1);

        let mut ids = vec![PAD_ID; text.len() * max_len * width];
        for (row, words) in encoded.iter().enumerate() {
            for (pos, chars) in words.iter().enumerate() {
                let offset = (row * max_len + pos) * width;
                ids[offset..offset + chars.len()].copy_from_slice(chars);
            }
        }
        Ok(Tensor::from_vec(ids, (text.len(), max_len, width), &self.device)?)
    }
}
