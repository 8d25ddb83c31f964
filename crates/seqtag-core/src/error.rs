use thiserror::Error;

/// Errors that can occur in seqtag core operations.
#[derive(Debug, Error)]
pub enum SeqTagError {
    /// The model configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A batch was prepared for a different set of feature sources than the model uses.
    #[error("feature mismatch: model uses [{expected}] but the batch was prepared for [{found}]")]
    FeatureMismatch {
        /// Feature sources of the model, in concatenation order.
        expected: String,
        /// Feature sources the batch carries.
        found: String,
    },

    /// A loaded vocabulary does not match the dimensions of the model parameters.
    #[error("{what} size mismatch: model has {expected}, vocabulary has {found}")]
    VocabMismatch {
        /// Which table disagrees ("tagset", "word vocabulary", ...).
        what: &'static str,
        /// Size recorded in the model.
        expected: usize,
        /// Size found in the vocabulary.
        found: usize,
    },

    /// A per-sentence length disagrees with the length implied by the mask.
    #[error("length mismatch for sentence {sentence}: expected {expected} tokens, got {found}")]
    LengthMismatch {
        /// Index of the sentence within the batch.
        sentence: usize,
        /// Length implied by the mask.
        expected: usize,
        /// Length produced by the source.
        found: usize,
    },

    /// Tensor dimensions are not what the operation requires.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The validity mask is not true-then-false on some row.
    #[error("mask row {row} is not contiguous: padding is followed by a real token")]
    InvalidMask {
        /// Offending batch row.
        row: usize,
    },

    /// A tag index or label is not part of the tag vocabulary.
    #[error("unknown tag: {0}")]
    UnknownTag(String),

    /// A sentence exceeds the configured maximum length.
    #[error("sequence of {length} tokens exceeds the maximum of {max}")]
    SequenceTooLong {
        /// Observed length.
        length: usize,
        /// Configured bound.
        max: usize,
    },

    /// The model or its companion files could not be loaded.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// The contextual embedding provider failed.
    #[error("contextual provider error: {0}")]
    Contextual(String),

    /// Candle ML framework error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for seqtag operations.
pub type Result<T> = std::result::Result<T, SeqTagError>;
