//! # Seqtag Trainer
//!
//! Everything around a [`SequenceTagger`](seqtag_core::SequenceTagger) that
//! is not the model itself: CoNLL corpus reading, pretrained word vectors,
//! the optimisation loop with early stopping, and span-level evaluation.

pub mod data;
pub mod metrics;
pub mod trainer;

pub use data::{Example, build_vocabulary, entity_types, load_conll, load_pretrained, parse_conll};
pub use metrics::{Metrics, Span, evaluate, extract_spans};
pub use trainer::{EpochStats, TrainConfig, TrainSummary, Trainer};
