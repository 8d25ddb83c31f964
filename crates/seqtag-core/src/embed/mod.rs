//! # Feature Embedder
//!
//! Builds one fixed-width vector per token by concatenating the enabled
//! sources in layout order (word, char, contextual). The fused width is
//! fixed when the embedder is built.

pub mod character;
pub mod contextual;
pub mod word;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Dropout, VarBuilder};
use tracing::debug;

pub use character::{CharEmbedding, Pooling};
pub use contextual::{ContextualProvider, DistilBertProvider};
pub use word::WordEmbedding;

use crate::batch::Batch;
use crate::config::{FeatureLayout, FeatureSource, TaggerConfig};
use crate::error::{Result, SeqTagError};
use crate::vocab::Vocabulary;

pub struct FeatureEmbedder {
    layout: FeatureLayout,
    word: Option<WordEmbedding>,
    chars: Option<CharEmbedding>,
    contextual: Option<Box<dyn ContextualProvider>>,
    dropout: Dropout,
    device: Device,
}

impl FeatureEmbedder {
    pub fn new(
        config: &TaggerConfig,
        vocab: &Vocabulary,
        contextual: Option<Box<dyn ContextualProvider>>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layout = config.layout()?;
        let word = if config.use_word {
            Some(WordEmbedding::new(
                vocab.words.len(),
                config.word_dim,
                config.freeze_word_embeddings,
                vb.pp("word"),
            )?)
        } else {
            None
        };
        let chars = if config.use_char {
            let pooling = if config.attention_pooling {
                Pooling::Attention
            } else {
                Pooling::Max
            };
            Some(CharEmbedding::new(
                vocab.chars.len(),
                config.char_dim,
                config.use_cnn,
                pooling,
                config.dropout,
                vb.pp("char"),
            )?)
        } else {
            None
        };

        let contextual = match (config.use_contextual, contextual) {
            (true, Some(provider)) => {
                if provider.dim() != config.contextual_dim {
                    return Err(SeqTagError::InvalidConfig(format!(
                        "contextual provider yields width {}, configuration says {}",
                        provider.dim(),
                        config.contextual_dim
                    )));
                }
                Some(provider)
            }
            (true, None) => {
                return Err(SeqTagError::InvalidConfig(
                    "contextual features enabled without a provider".into(),
                ));
            }
            (false, _) => None,
        };

        Ok(Self {
            layout,
            word,
            chars,
            contextual,
            dropout: Dropout::new(config.dropout),
            device: vb.device().clone(),
        })
    }

    pub fn layout(&self) -> &FeatureLayout {
        &self.layout
    }

    /// Fused width `F`.
    pub fn width(&self) -> usize {
        self.layout.width()
    }

    pub fn word(&self) -> Option<&WordEmbedding> {
        self.word.as_ref()
    }

    /// Fused `(batch, max_len, F)` features and each sentence's true length.
    pub fn embed(&self, batch: &Batch, train: bool) -> Result<(Tensor, Vec<usize>)> {
        self.check_features(batch)?;
        let mut parts = Vec::with_capacity(self.layout.sources().len());
        for (source, _) in self.layout.sources() {
            let part = match source {
                FeatureSource::Word => match (&self.word, &batch.word_ids) {
                    (Some(word), Some(ids)) => word.forward(ids)?,
                    _ => return Err(self.mismatch(batch)),
                },
                FeatureSource::Char => match (&self.chars, &batch.char_ids) {
                    (Some(chars), Some(ids)) => chars.forward(ids, train)?,
                    _ => return Err(self.mismatch(batch)),
                },
                FeatureSource::Contextual => match &self.contextual {
                    Some(provider) => self.contextual_features(provider.as_ref(), batch)?,
                    None => return Err(self.mismatch(batch)),
                },
            };
            parts.push(part.to_dtype(DType::F32)?);
        }

        let fused = Tensor::cat(&parts, 2)?;
        let fused = self.dropout.forward(&fused, train)?;
        debug!(dims = ?fused.dims(), "fused features");
        Ok((fused, batch.lengths().to_vec()))
    }

    fn check_features(&self, batch: &Batch) -> Result<()> {
        let expected: Vec<FeatureSource> = self.layout.sources().iter().map(|(s, _)| *s).collect();
        if batch.features != expected {
            return Err(self.mismatch(batch));
        }
        Ok(())
    }

    fn mismatch(&self, batch: &Batch) -> SeqTagError {
        SeqTagError::FeatureMismatch {
            expected: source_names(self.layout.sources().iter().map(|(s, _)| *s)),
            found: source_names(batch.features.iter().copied()),
        }
    }

    /// Per-sentence provider output, length-checked and padded to `max_len`.
    fn contextual_features(&self, provider: &dyn ContextualProvider, batch: &Batch) -> Result<Tensor> {
        let max_len = batch.max_len();
        let dim = provider.dim();
        let device = &self.device;

        let mut rows = Vec::with_capacity(batch.batch_size());
        for (sentence, tokens) in batch.text.iter().enumerate() {
            let expected = batch.mask.len(sentence);
            let vectors = provider.embed(tokens, device)?;
            let (found, width) = vectors.dims2()?;
            if found != expected {
                return Err(SeqTagError::LengthMismatch {
                    sentence,
                    expected,
                    found,
                });
            }
            if width != dim {
                return Err(SeqTagError::ShapeMismatch(format!(
                    "contextual vectors for sentence {sentence} have width {width}, expected {dim}"
                )));
            }
            let vectors = vectors.to_dtype(DType::F32)?.detach();
            let row = if found < max_len {
                let pad = Tensor::zeros((max_len - found, dim), DType::F32, device)?;
                Tensor::cat(&[vectors, pad], 0)?
            } else {
                vectors
            };
            rows.push(row);
        }
        Ok(Tensor::stack(&rows, 0)?)
    }
}

fn source_names(sources: impl Iterator<Item = FeatureSource>) -> String {
    sources.map(|s| s.name()).collect::<Vec<_>>().join(", ")
}
