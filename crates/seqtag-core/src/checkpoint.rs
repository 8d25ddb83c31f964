//! # Checkpoints
//!
//! A checkpoint is a directory with three files:
//!
//! | file | content |
//! |---|---|
//! | `model.safetensors` | every parameter of the tagger |
//! | `config.json` | [`TaggerConfig`] plus the table sizes the model was built for |
//! | `vocab.json` | word, char and tag vocabularies |
//!
//! Loading refuses a checkpoint whose vocabularies disagree with either the
//! recorded sizes or the stored tensor shapes.

use std::path::Path;
use std::sync::Arc;

use candle_core::Device;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::TaggerConfig;
use crate::embed::ContextualProvider;
use crate::error::{Result, SeqTagError};
use crate::model::{CRF_PREFIX, EMISSION_PREFIX, SequenceTagger, WORD_TABLE};
use crate::vocab::Vocabulary;

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const CONFIG_FILE: &str = "config.json";
pub const VOCAB_FILE: &str = "vocab.json";

const CHAR_TABLE: &str = "embedder.char.embedding.weight";

/// Contents of `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub tagger: TaggerConfig,
    pub num_tags: usize,
    pub word_vocab_size: usize,
    pub char_vocab_size: usize,
    pub feature_width: usize,
}

impl CheckpointConfig {
    pub fn of(tagger: &SequenceTagger) -> Self {
        let vocab = tagger.vocab();
        Self {
            tagger: tagger.config().clone(),
            num_tags: vocab.tags.len(),
            word_vocab_size: vocab.words.len(),
            char_vocab_size: vocab.chars.len(),
            feature_width: tagger.feature_width(),
        }
    }

    /// Compare recorded sizes with a loaded vocabulary.
    fn check_vocab(&self, vocab: &Vocabulary) -> Result<()> {
        check("tagset", self.num_tags, vocab.tags.len())?;
        if self.tagger.use_word {
            check("word vocabulary", self.word_vocab_size, vocab.words.len())?;
        }
        if self.tagger.use_char {
            check("char vocabulary", self.char_vocab_size, vocab.chars.len())?;
        }
        Ok(())
    }
}

fn check(what: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(SeqTagError::VocabMismatch {
            what,
            expected,
            found,
        });
    }
    Ok(())
}

/// Write `tagger` into `dir`, creating it if needed.
pub fn save(tagger: &SequenceTagger, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    tagger.varmap().save(dir.join(WEIGHTS_FILE))?;
    let config = CheckpointConfig::of(tagger);
    std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&config)?)?;
    std::fs::write(
        dir.join(VOCAB_FILE),
        serde_json::to_string_pretty(tagger.vocab().as_ref())?,
    )?;
    info!(dir = %dir.display(), "saved checkpoint");
    Ok(())
}

/// Read only `config.json` and `vocab.json`.
pub fn read_metadata(dir: &Path) -> Result<(CheckpointConfig, Vocabulary)> {
    let config: CheckpointConfig =
        serde_json::from_str(&std::fs::read_to_string(dir.join(CONFIG_FILE))?)?;
    let vocab: Vocabulary = serde_json::from_str(&std::fs::read_to_string(dir.join(VOCAB_FILE))?)?;
    Ok((config, vocab))
}

/// Rebuild a tagger from `dir`.
///
/// `contextual` must be supplied when the checkpoint was trained with
/// contextual features.
pub fn load(
    dir: &Path,
    contextual: Option<Box<dyn ContextualProvider>>,
    device: &Device,
) -> Result<SequenceTagger> {
    let (config, vocab) = read_metadata(dir)?;
    config.check_vocab(&vocab)?;

    let weights = dir.join(WEIGHTS_FILE);
    let bytes = std::fs::read(&weights)?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| SeqTagError::ModelLoad(format!("{}: {e}", weights.display())))?;
    check_shapes(&tensors, &config, &vocab)?;

    let mut tagger = SequenceTagger::new(config.tagger.clone(), Arc::new(vocab), contextual, device)?;
    if tagger.feature_width() != config.feature_width {
        return Err(SeqTagError::ModelLoad(format!(
            "feature width {} does not match recorded {}",
            tagger.feature_width(),
            config.feature_width
        )));
    }
    tagger.varmap_mut().load(&weights)?;
    info!(dir = %dir.display(), tags = config.num_tags, "loaded checkpoint");
    Ok(tagger)
}

/// Leading dimension of a stored tensor.
fn rows(tensors: &SafeTensors, name: &str) -> Result<usize> {
    let view = tensors
        .tensor(name)
        .map_err(|e| SeqTagError::ModelLoad(format!("{name}: {e}")))?;
    view.shape()
        .first()
        .copied()
        .ok_or_else(|| SeqTagError::ModelLoad(format!("{name} is a scalar")))
}

fn check_shapes(tensors: &SafeTensors, config: &CheckpointConfig, vocab: &Vocabulary) -> Result<()> {
    let num_tags = vocab.tags.len();
    check("tagset", rows(tensors, &format!("{EMISSION_PREFIX}.weight"))?, num_tags)?;
    if config.tagger.use_crf {
        let states = rows(tensors, &format!("{CRF_PREFIX}.transitions"))?;
        check("tagset", states.saturating_sub(2), num_tags)?;
    }
    if config.tagger.use_word {
        check("word vocabulary", rows(tensors, WORD_TABLE)?, vocab.words.len())?;
    }
    if config.tagger.use_char {
        check("char vocabulary", rows(tensors, CHAR_TABLE)?, vocab.chars.len())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{tiny_config, tiny_vocab};
    use crate::vocab::{SymbolVocab, TagVocab};

    fn sentences() -> Vec<Vec<&'static str>> {
        vec![
            vec!["John", "Smith", "visited", "Paris"],
            vec!["Mary", "lives", "in", "Rome"],
            vec![],
        ]
    }

    #[test]
    fn test_round_trip_reproduces_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config().with_constrained_transitions(true);
        let tagger = SequenceTagger::new(config, tiny_vocab(), None, &Device::Cpu).unwrap();
        save(&tagger, dir.path()).unwrap();
        for file in [WEIGHTS_FILE, CONFIG_FILE, VOCAB_FILE] {
            assert!(dir.path().join(file).exists(), "{file} missing");
        }

        let restored = load(dir.path(), None, &Device::Cpu).unwrap();
        assert_eq!(restored.config(), tagger.config());
        assert_eq!(restored.vocab(), tagger.vocab());
        let before = tagger.predict(&sentences()).unwrap();
        let after = restored.predict(&sentences()).unwrap();
        assert_eq!(before, after);

        let a = tagger.crf().unwrap().transition_matrix().unwrap();
        let b = restored.crf().unwrap().transition_matrix().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_tagset_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let tagger = SequenceTagger::new(tiny_config(), tiny_vocab(), None, &Device::Cpu).unwrap();
        save(&tagger, dir.path()).unwrap();

        // swap in a vocabulary with an extra entity type, keeping config.json
        let mut vocab = tiny_vocab().as_ref().clone();
        vocab.tags = TagVocab::bio(&["PER", "LOC", "ORG"]).unwrap();
        std::fs::write(
            dir.path().join(VOCAB_FILE),
            serde_json::to_string(&vocab).unwrap(),
        )
        .unwrap();
        let err = load(dir.path(), None, &Device::Cpu).err().expect("mismatch");
        assert!(matches!(err, SeqTagError::VocabMismatch { what: "tagset", .. }));
    }

    #[test]
    fn test_rejects_word_table_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let tagger = SequenceTagger::new(tiny_config(), tiny_vocab(), None, &Device::Cpu).unwrap();
        save(&tagger, dir.path()).unwrap();

        // vocabulary and config agree with each other but not with the weights
        let mut vocab = tiny_vocab().as_ref().clone();
        let mut words: Vec<String> = vocab.words.symbols().to_vec();
        words.push("extra".into());
        vocab.words = SymbolVocab::from(words);
        let mut config = CheckpointConfig::of(&tagger);
        config.word_vocab_size = vocab.words.len();
        std::fs::write(dir.path().join(VOCAB_FILE), serde_json::to_string(&vocab).unwrap()).unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), serde_json::to_string(&config).unwrap()).unwrap();

        let err = load(dir.path(), None, &Device::Cpu).err().expect("mismatch");
        assert!(matches!(err, SeqTagError::VocabMismatch { what: "word vocabulary", .. }));
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent"), None, &Device::Cpu).err().expect("missing");
        assert!(matches!(err, SeqTagError::Io(_)));
    }
}
