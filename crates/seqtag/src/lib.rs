//! # Seqtag
//!
//! Named-entity recognition with a BiLSTM-CRF tagger.
//!
//! - [`core`]: vocabularies, the tagger model, the CRF and checkpoints
//! - [`trainer`]: CoNLL data, pretrained tables, the training loop and span metrics

pub use seqtag_core as core;
pub use seqtag_trainer as trainer;

pub use seqtag_core::{
    Batch, CrfLayer, Reduction, Result, SeqTagError, SequenceTagger, TagVocab, TaggerConfig,
    Vocabulary, checkpoint,
};
pub use seqtag_trainer::{Example, TrainConfig, Trainer, evaluate};
