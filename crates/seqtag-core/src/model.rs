//! # Sequence Tagger
//!
//! The full pipeline: feature embedder, bidirectional encoder, emission
//! scorer and (optionally) a CRF. All parameters live in one [`VarMap`],
//! which is what checkpoints persist.
//!
//! ```text
//! batch -> FeatureEmbedder -> SequenceEncoder -> EmissionScorer -> CrfLayer
//!                                                              \-> argmax (no CRF)
//! ```

use std::sync::Arc;

use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

use crate::batch::{Batch, BatchEncoder};
use crate::config::TaggerConfig;
use crate::crf::CrfLayer;
use crate::embed::{ContextualProvider, FeatureEmbedder};
use crate::emission::EmissionScorer;
use crate::encoder::{BiLstmEncoder, SequenceEncoder};
use crate::error::{Result, SeqTagError};
use crate::mask::Mask;
use crate::vocab::Vocabulary;

/// Parameter prefixes inside the variable map.
pub const EMBEDDER_PREFIX: &str = "embedder";
pub const ENCODER_PREFIX: &str = "encoder";
pub const EMISSION_PREFIX: &str = "emission";
pub const CRF_PREFIX: &str = "crf";
/// Full name of the word table.
pub const WORD_TABLE: &str = "embedder.word.weight";

pub struct SequenceTagger {
    config: TaggerConfig,
    vocab: Arc<Vocabulary>,
    varmap: VarMap,
    device: Device,
    batcher: BatchEncoder,
    embedder: FeatureEmbedder,
    encoder: Box<dyn SequenceEncoder>,
    scorer: EmissionScorer,
    crf: Option<CrfLayer>,
}

impl SequenceTagger {
    /// Build a freshly initialised tagger for `vocab`.
    pub fn new(
        config: TaggerConfig,
        vocab: Arc<Vocabulary>,
        contextual: Option<Box<dyn ContextualProvider>>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embedder = FeatureEmbedder::new(&config, &vocab, contextual, vb.pp(EMBEDDER_PREFIX))?;
        let encoder = BiLstmEncoder::new(
            embedder.width(),
            config.hidden_dim,
            config.num_layers,
            vb.pp(ENCODER_PREFIX),
        )?;
        let num_tags = vocab.tags.len();
        let scorer = EmissionScorer::new(
            encoder.output_dim(),
            num_tags,
            config.dropout,
            vb.pp(EMISSION_PREFIX),
        )?;
        let crf = if config.use_crf {
            Some(CrfLayer::new(
                &vocab.tags,
                config.constrain_transitions,
                vb.pp(CRF_PREFIX),
            )?)
        } else {
            None
        };
        let batcher = BatchEncoder::new(
            Arc::clone(&vocab),
            embedder.layout(),
            config.max_sequence_length,
            device,
        );

        info!(
            tags = num_tags,
            words = vocab.words.len(),
            chars = vocab.chars.len(),
            feature_width = embedder.width(),
            crf = config.use_crf,
            "built sequence tagger"
        );

        Ok(Self {
            config,
            vocab,
            varmap,
            device: device.clone(),
            batcher,
            embedder,
            encoder: Box::new(encoder),
            scorer,
            crf,
        })
    }

    pub fn config(&self) -> &TaggerConfig {
        &self.config
    }

    pub fn vocab(&self) -> &Arc<Vocabulary> {
        &self.vocab
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub(crate) fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_tags(&self) -> usize {
        self.vocab.tags.len()
    }

    /// Width of the fused per-token features.
    pub fn feature_width(&self) -> usize {
        self.embedder.width()
    }

    pub fn crf(&self) -> Option<&CrfLayer> {
        self.crf.as_ref()
    }

    pub fn batch_encoder(&self) -> &BatchEncoder {
        &self.batcher
    }

    /// Encode raw sentences for this tagger.
    pub fn encode<S: AsRef<str>>(&self, sentences: &[Vec<S>]) -> Result<Batch> {
        self.batcher.encode(sentences)
    }

    /// Encode sentences with gold labels for this tagger.
    pub fn encode_tagged<S: AsRef<str>, T: AsRef<str>>(
        &self,
        sentences: &[Vec<S>],
        tags: &[Vec<T>],
    ) -> Result<Batch> {
        self.batcher.encode_tagged(sentences, tags)
    }

    /// Variables the optimizer should update.
    ///
    /// A frozen word table stays in the map (so it is saved) but is left out.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let frozen = self.config.use_word && self.config.freeze_word_embeddings;
        let data = self.varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| !(frozen && name.as_str() == WORD_TABLE))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars.into_iter().map(|(_, var)| var).collect()
    }

    /// Install a pretrained `(word_vocab, word_dim)` table.
    pub fn load_word_table(&mut self, table: &Tensor) -> Result<()> {
        let word = self.embedder.word().ok_or_else(|| {
            SeqTagError::InvalidConfig("word features are disabled".into())
        })?;
        word.check_table(table)?;
        let table = table.to_dtype(DType::F32)?.to_device(&self.device)?;
        self.varmap.set_one(WORD_TABLE, &table)?;
        info!(rows = table.dim(0)?, "installed pretrained word table");
        Ok(())
    }

    /// Emission scores `(batch, max_len, num_tags)`.
    pub fn emissions(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        if batch.max_len() == 0 {
            return Ok(Tensor::zeros(
                (batch.batch_size(), 0, self.num_tags()),
                DType::F32,
                &self.device,
            )?);
        }
        let (features, lengths) = self.embedder.embed(batch, train)?;
        let hidden = self.encoder.encode(&features, &lengths, train)?;
        self.scorer.forward(&hidden, train)
    }

    /// Per-sentence `log P(gold | sentence)`, shape `(batch,)`.
    ///
    /// Without a CRF this is the sum of per-token log-softmax scores.
    pub fn log_likelihood(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let gold = batch.gold()?;
        let emissions = self.emissions(batch, train)?;
        match &self.crf {
            Some(crf) => crf.log_likelihood(&emissions, &batch.mask, gold),
            None => self.token_log_likelihood(&emissions, &batch.mask, gold),
        }
    }

    /// Training loss reduced as configured.
    pub fn loss(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let llh = self.log_likelihood(batch, train)?;
        debug!(batch = batch.batch_size(), "computed loss");
        self.config.reduction.apply(llh.neg()?)
    }

    /// Best tag indices for each sentence, each of its true length.
    pub fn decode(&self, batch: &Batch) -> Result<Vec<Vec<usize>>> {
        if batch.max_len() == 0 {
            return Ok(vec![Vec::new(); batch.batch_size()]);
        }
        let emissions = self.emissions(batch, false)?;
        match &self.crf {
            Some(crf) => crf.decode(&emissions, &batch.mask),
            None => argmax_decode(&emissions, &batch.mask),
        }
    }

    /// Tag raw sentences, returning label strings.
    pub fn predict<S: AsRef<str>>(&self, sentences: &[Vec<S>]) -> Result<Vec<Vec<String>>> {
        let batch = self.encode(sentences)?;
        self.decode(&batch)?
            .iter()
            .map(|path| {
                Ok(self
                    .vocab
                    .tags
                    .decode(path)?
                    .into_iter()
                    .map(str::to_string)
                    .collect())
            })
            .collect()
    }

    fn token_log_likelihood(&self, emissions: &Tensor, mask: &Mask, gold: &[Vec<usize>]) -> Result<Tensor> {
        let (batch, len, num_tags) = emissions.dims3()?;
        if gold.len() != batch {
            return Err(SeqTagError::ShapeMismatch(format!(
                "{} gold sequences for a batch of {batch}",
                gold.len()
            )));
        }
        let mut padded = vec![0u32; batch * len];
        for (row, tags) in gold.iter().enumerate() {
            if tags.len() != mask.len(row) {
                return Err(SeqTagError::LengthMismatch {
                    sentence: row,
                    expected: mask.len(row),
                    found: tags.len(),
                });
            }
            for (pos, &tag) in tags.iter().enumerate() {
                if tag >= num_tags {
                    return Err(SeqTagError::UnknownTag(format!("index {tag}")));
                }
                padded[row * len + pos] = tag as u32;
            }
        }
        if len == 0 {
            return Ok(Tensor::zeros(batch, emissions.dtype(), emissions.device())?);
        }

        let ids = Tensor::from_vec(padded, (batch, len, 1), emissions.device())?;
        let log_probs = candle_nn::ops::log_softmax(emissions, D::Minus1)?;
        let keep = mask.to_tensor(emissions.dtype(), emissions.device())?;
        Ok(log_probs.gather(&ids, 2)?.squeeze(2)?.mul(&keep)?.sum(1)?)
    }
}

/// Per-token argmax, cut to each row's true length.
fn argmax_decode(emissions: &Tensor, mask: &Mask) -> Result<Vec<Vec<usize>>> {
    let best: Vec<Vec<u32>> = emissions.argmax(D::Minus1)?.to_vec2()?;
    Ok(best
        .into_iter()
        .zip(mask.lengths())
        .map(|(row, &len)| row.into_iter().take(len).map(|t| t as usize).collect())
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crf::Reduction;
    use crate::vocab::TagVocab;

    pub(crate) fn tiny_vocab() -> Arc<Vocabulary> {
        let sentences = vec![
            vec!["John", "Smith", "visited", "Paris"],
            vec!["Mary", "lives", "in", "Rome"],
        ];
        Arc::new(Vocabulary::build(
            &sentences,
            TagVocab::bio(&["PER", "LOC"]).unwrap(),
            1,
        ))
    }

    pub(crate) fn tiny_config() -> TaggerConfig {
        TaggerConfig::new()
            .with_word_dim(8)
            .with_char_dim(4)
            .with_hidden(6, 1)
            .with_dropout(0.0)
    }

    #[test]
    fn test_emission_shape() {
        let tagger = SequenceTagger::new(tiny_config(), tiny_vocab(), None, &Device::Cpu).unwrap();
        let batch = tagger.encode(&[vec!["John", "visited"], vec!["Rome"]]).unwrap();
        let emissions = tagger.emissions(&batch, false).unwrap();
        assert_eq!(emissions.dims(), &[2, 2, 5]);
    }

    #[test]
    fn test_decode_lengths_match_input() {
        for use_crf in [true, false] {
            let config = tiny_config().with_crf(use_crf);
            let tagger = SequenceTagger::new(config, tiny_vocab(), None, &Device::Cpu).unwrap();
            let sentences = vec![vec!["John", "Smith", "visited"], vec![], vec!["Paris"]];
            let paths = tagger.decode(&tagger.encode(&sentences).unwrap()).unwrap();
            let lengths: Vec<usize> = paths.iter().map(Vec::len).collect();
            assert_eq!(lengths, vec![3, 0, 1]);
            let labels = tagger.predict(&sentences).unwrap();
            assert!(labels.iter().flatten().all(|l| tagger.vocab().tags.index(l).is_some()));
        }
    }

    #[test]
    fn test_loss_is_positive_with_gradients() {
        for use_crf in [true, false] {
            let config = tiny_config().with_crf(use_crf).with_reduction(Reduction::Mean);
            let tagger = SequenceTagger::new(config, tiny_vocab(), None, &Device::Cpu).unwrap();
            let batch = tagger
                .encode_tagged(
                    &[vec!["John", "Smith"], vec!["in", "Rome"]],
                    &[vec!["B-PER", "I-PER"], vec!["O", "B-LOC"]],
                )
                .unwrap();
            let loss = tagger.loss(&batch, true).unwrap();
            assert!(loss.to_scalar::<f32>().unwrap() > 0.0);
            let grads = loss.backward().unwrap();
            let vars = tagger.trainable_vars();
            assert!(vars.iter().any(|v| grads.get(v.as_tensor()).is_some()));
        }
    }

    #[test]
    fn test_frozen_word_table_is_not_trainable() {
        let frozen = SequenceTagger::new(
            tiny_config().with_frozen_words(true),
            tiny_vocab(),
            None,
            &Device::Cpu,
        )
        .unwrap();
        let tuned = SequenceTagger::new(tiny_config(), tiny_vocab(), None, &Device::Cpu).unwrap();
        assert_eq!(frozen.trainable_vars().len() + 1, tuned.trainable_vars().len());
        assert!(frozen.varmap().data().lock().unwrap().contains_key(WORD_TABLE));
    }

    #[test]
    fn test_default_config_trains_word_table() {
        let tagger = SequenceTagger::new(tiny_config(), tiny_vocab(), None, &Device::Cpu).unwrap();
        let table = tagger.varmap().data().lock().unwrap()[WORD_TABLE].clone();
        let vars = tagger.trainable_vars();
        assert_eq!(vars.len(), tagger.varmap().all_vars().len());
        assert!(vars.iter().any(|v| v.as_tensor().id() == table.as_tensor().id()));
    }

    #[test]
    fn test_emissions_do_not_depend_on_batch_mates() {
        for (use_cnn, attention) in [(true, false), (false, false), (true, true)] {
            let config = tiny_config().with_cnn(use_cnn).with_attention_pooling(attention);
            let tagger = SequenceTagger::new(config, tiny_vocab(), None, &Device::Cpu).unwrap();

            let alone = tagger.encode(&[vec!["Rome"]]).unwrap();
            let alone = tagger.emissions(&alone, false).unwrap().get(0).unwrap();
            let mixed = tagger
                .encode(&[vec!["John", "Smith", "visited", "Paris"], vec!["Rome"]])
                .unwrap();
            let mixed = tagger
                .emissions(&mixed, false)
                .unwrap()
                .get(1)
                .unwrap()
                .narrow(0, 0, 1)
                .unwrap();
            let diff = alone
                .sub(&mixed)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-5, "cnn={use_cnn} attention={attention}: diff {diff}");

            let sentences = vec![vec!["Mary", "visited", "Rome"], vec!["in"]];
            let together = tagger.predict(&sentences).unwrap();
            for (sentence, expected) in sentences.iter().zip(&together) {
                let single = tagger.predict(std::slice::from_ref(sentence)).unwrap();
                assert_eq!(&single[0], expected);
            }
        }
    }

    #[test]
    fn test_load_word_table() {
        let vocab = tiny_vocab();
        let mut tagger = SequenceTagger::new(tiny_config(), Arc::clone(&vocab), None, &Device::Cpu).unwrap();
        let table = Tensor::ones((vocab.words.len(), 8), DType::F32, &Device::Cpu).unwrap();
        tagger.load_word_table(&table).unwrap();
        let batch = tagger.encode(&[vec!["John"]]).unwrap();
        let (features, _) = tagger.embedder.embed(&batch, false).unwrap();
        let words: Vec<f32> = features.narrow(2, 0, 8).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(words.iter().all(|&v| v == 1.0));

        let wrong = Tensor::ones((vocab.words.len() + 1, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(tagger.load_word_table(&wrong).is_err());
    }

    #[test]
    fn test_all_empty_batch() {
        let tagger = SequenceTagger::new(tiny_config(), tiny_vocab(), None, &Device::Cpu).unwrap();
        let batch = tagger
            .encode_tagged::<&str, &str>(&[vec![], vec![]], &[vec![], vec![]])
            .unwrap();
        let loss = tagger.loss(&batch, true).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
        assert_eq!(tagger.decode(&batch).unwrap(), vec![Vec::<usize>::new(); 2]);
    }
}
