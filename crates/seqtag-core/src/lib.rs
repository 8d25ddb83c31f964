//! # Seqtag Core
//!
//! Neural sequence labeling for named-entity recognition: fused word,
//! character and contextual features feed a bidirectional LSTM whose
//! per-token emission scores are decoded by a linear-chain CRF.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use candle_core::Device;
//! use seqtag_core::{SequenceTagger, TagVocab, TaggerConfig, Vocabulary};
//!
//! let sentences = vec![vec!["Ada", "Lovelace", "lived", "in", "London"]];
//! let vocab = Vocabulary::build(&sentences, TagVocab::bio(&["PER", "LOC"]).unwrap(), 1);
//! let config = TaggerConfig::new().with_hidden(16, 1);
//! let tagger = SequenceTagger::new(config, Arc::new(vocab), None, &Device::Cpu).unwrap();
//!
//! let tags = tagger.predict(&sentences).unwrap();
//! assert_eq!(tags[0].len(), 5);
//! ```
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod crf;
pub mod embed;
pub mod emission;
pub mod encoder;
pub mod error;
pub mod mask;
pub mod model;
pub mod vocab;

// Re-export primary API
pub use batch::{Batch, BatchEncoder};
pub use config::{FeatureLayout, FeatureSource, TaggerConfig};
pub use crf::{CrfLayer, ILLEGAL_SCORE, Reduction, TransitionMatrix, ViterbiDecoder};
pub use embed::{ContextualProvider, DistilBertProvider, FeatureEmbedder};
pub use encoder::{BiLstmEncoder, SequenceEncoder};
pub use error::{Result, SeqTagError};
pub use mask::Mask;
pub use model::SequenceTagger;
pub use vocab::{SymbolVocab, TagKind, TagVocab, Vocabulary};
