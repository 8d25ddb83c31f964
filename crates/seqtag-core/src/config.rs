//! # Tagger Configuration
//!
//! Which feature sources are active, layer widths, and how the output layer
//! is trained. The active sources are resolved once into a
//! [`FeatureLayout`] that fixes the concatenation order and fused width.

use serde::{Deserialize, Serialize};

use crate::crf::Reduction;
use crate::error::{Result, SeqTagError};

/// Configuration for a [`SequenceTagger`](crate::model::SequenceTagger).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggerConfig {
    /// Use the word lookup table.
    pub use_word: bool,
    /// Use pooled character embeddings.
    pub use_char: bool,
    /// Use the external contextual provider.
    pub use_contextual: bool,
    /// Train and decode through the CRF; otherwise per-token cross-entropy and argmax.
    pub use_crf: bool,
    /// Convolve character embeddings before pooling.
    pub use_cnn: bool,
    /// Learned attention pooling over characters instead of max pooling.
    pub attention_pooling: bool,
    /// Word embedding width (overridden by a pretrained table's width).
    pub word_dim: usize,
    /// Character embedding width.
    pub char_dim: usize,
    /// Contextual embedding width, taken from the provider.
    pub contextual_dim: usize,
    /// Dropout probability for fused features, char convolution and emissions.
    pub dropout: f32,
    /// Encoder output width; split evenly between the two directions.
    pub hidden_dim: usize,
    /// Stacked encoder layers.
    pub num_layers: usize,
    /// Keep a pretrained word table fixed during training.
    pub freeze_word_embeddings: bool,
    /// Pin BIO-illegal transitions in the CRF.
    pub constrain_transitions: bool,
    /// Loss reduction over the batch.
    pub reduction: Reduction,
    /// Longest sentence accepted.
    pub max_sequence_length: usize,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            use_word: true,
            use_char: true,
            use_contextual: false,
            use_crf: true,
            use_cnn: true,
            attention_pooling: false,
            word_dim: 100,
            char_dim: 30,
            contextual_dim: 0,
            dropout: 0.1,
            hidden_dim: 256,
            num_layers: 1,
            freeze_word_embeddings: false,
            constrain_transitions: false,
            reduction: Reduction::Mean,
            max_sequence_length: 512,
        }
    }
}

impl TaggerConfig {
    /// Create a new configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the word table.
    pub fn with_word(mut self, enabled: bool) -> Self {
        self.use_word = enabled;
        self
    }

    /// Enable or disable character features.
    pub fn with_char(mut self, enabled: bool) -> Self {
        self.use_char = enabled;
        self
    }

    /// Enable contextual features of the given width (0 disables them).
    pub fn with_contextual(mut self, dim: usize) -> Self {
        self.use_contextual = dim > 0;
        self.contextual_dim = dim;
        self
    }

    pub fn with_crf(mut self, enabled: bool) -> Self {
        self.use_crf = enabled;
        self
    }

    pub fn with_cnn(mut self, enabled: bool) -> Self {
        self.use_cnn = enabled;
        self
    }

    pub fn with_attention_pooling(mut self, enabled: bool) -> Self {
        self.attention_pooling = enabled;
        self
    }

    pub fn with_word_dim(mut self, dim: usize) -> Self {
        self.word_dim = dim;
        self
    }

    pub fn with_char_dim(mut self, dim: usize) -> Self {
        self.char_dim = dim;
        self
    }

    /// Set the dropout probability, clamped to `[0, 1)`.
    pub fn with_dropout(mut self, p: f32) -> Self {
        self.dropout = p.clamp(0.0, 0.99);
        self
    }

    pub fn with_hidden(mut self, hidden_dim: usize, num_layers: usize) -> Self {
        self.hidden_dim = hidden_dim;
        self.num_layers = num_layers;
        self
    }

    pub fn with_frozen_words(mut self, frozen: bool) -> Self {
        self.freeze_word_embeddings = frozen;
        self
    }

    pub fn with_constrained_transitions(mut self, enabled: bool) -> Self {
        self.constrain_transitions = enabled;
        self
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn with_max_sequence_length(mut self, max: usize) -> Self {
        self.max_sequence_length = max;
        self
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SeqTagError::InvalidConfig(msg.to_string()));
        if !(self.use_word || self.use_char || self.use_contextual) {
            return invalid("at least one feature source must be enabled");
        }
        if self.use_word && self.word_dim == 0 {
            return invalid("word_dim must be positive");
        }
        if self.use_char && self.char_dim == 0 {
            return invalid("char_dim must be positive");
        }
        if self.use_contextual && self.contextual_dim == 0 {
            return invalid("contextual features need a positive contextual_dim");
        }
        if self.hidden_dim == 0 || self.hidden_dim % 2 != 0 {
            return invalid("hidden_dim must be a positive even number");
        }
        if self.num_layers == 0 {
            return invalid("num_layers must be at least 1");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid("dropout must be in [0, 1)");
        }
        if self.max_sequence_length == 0 {
            return invalid("max_sequence_length must be positive");
        }
        Ok(())
    }

    /// Resolve the active feature sources.
    pub fn layout(&self) -> Result<FeatureLayout> {
        self.validate()?;
        let mut sources = Vec::with_capacity(3);
        if self.use_word {
            sources.push((FeatureSource::Word, self.word_dim));
        }
        if self.use_char {
            sources.push((FeatureSource::Char, self.char_dim));
        }
        if self.use_contextual {
            sources.push((FeatureSource::Contextual, self.contextual_dim));
        }
        Ok(FeatureLayout { sources })
    }
}

/// A per-token feature source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureSource {
    Word,
    Char,
    Contextual,
}

impl FeatureSource {
    pub fn name(&self) -> &'static str {
        match self {
            FeatureSource::Word => "word",
            FeatureSource::Char => "char",
            FeatureSource::Contextual => "contextual",
        }
    }
}

/// Fixed concatenation order and widths of the active sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureLayout {
    sources: Vec<(FeatureSource, usize)>,
}

impl FeatureLayout {
    /// Sources in concatenation order with their widths.
    pub fn sources(&self) -> &[(FeatureSource, usize)] {
        &self.sources
    }

    pub fn contains(&self, source: FeatureSource) -> bool {
        self.sources.iter().any(|(s, _)| *s == source)
    }

    /// Width of the fused feature vector.
    pub fn width(&self) -> usize {
        self.sources.iter().map(|(_, w)| w).sum()
    }

    /// Column range of `source` inside the fused vector.
    pub fn offset(&self, source: FeatureSource) -> Option<(usize, usize)> {
        let mut start = 0;
        for &(s, w) in &self.sources {
            if s == source {
                return Some((start, w));
            }
            start += w;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = TaggerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.use_crf);
    }

    #[test]
    fn test_layout_order_and_width() {
        let config = TaggerConfig::new()
            .with_word_dim(50)
            .with_char_dim(20)
            .with_contextual(64);
        let layout = config.layout().unwrap();
        assert_eq!(layout.width(), 134);
        assert_eq!(
            layout.sources(),
            &[
                (FeatureSource::Word, 50),
                (FeatureSource::Char, 20),
                (FeatureSource::Contextual, 64)
            ]
        );
        assert_eq!(layout.offset(FeatureSource::Contextual), Some((70, 64)));
    }

    #[test]
    fn test_layout_skips_disabled_sources() {
        let layout = TaggerConfig::new().with_word(false).layout().unwrap();
        assert!(!layout.contains(FeatureSource::Word));
        assert_eq!(layout.width(), 30);
        assert_eq!(layout.offset(FeatureSource::Char), Some((0, 30)));
    }

    #[test]
    fn test_validation_errors() {
        let none = TaggerConfig::new().with_word(false).with_char(false);
        assert!(none.validate().is_err());
        assert!(TaggerConfig::new().with_hidden(255, 1).validate().is_err());
        assert!(TaggerConfig::new().with_hidden(256, 0).validate().is_err());
        let mut ctx = TaggerConfig::new();
        ctx.use_contextual = true;
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: TaggerConfig = serde_json::from_str(r#"{"use_crf": false}"#).unwrap();
        assert!(!config.use_crf);
        assert_eq!(config.hidden_dim, 256);
        let json = serde_json::to_string(&config).unwrap();
        let back: TaggerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
