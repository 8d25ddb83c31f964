//! Mini-batch training loop with early stopping.

use std::path::Path;

use anyhow::{Context, bail};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use seqtag_core::{Reduction, SequenceTagger, checkpoint};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::{Example, tag_lists, token_lists};
use crate::metrics::evaluate;

/// Optimisation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Upper bound on passes over the training set.
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Global gradient norm ceiling; `0` disables clipping.
    pub gradient_clip: f32,
    /// Epochs without validation improvement before stopping.
    pub patience: usize,
    /// Seed for batch shuffling.
    pub seed: u64,
    /// Minimum corpus frequency for a word to enter the vocabulary.
    pub min_word_freq: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 8,
            learning_rate: 1e-4,
            weight_decay: 0.0,
            gradient_clip: 5.0,
            patience: 10,
            seed: 42,
            min_word_freq: 1,
        }
    }
}

impl TrainConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_gradient_clip(mut self, clip: f32) -> Self {
        self.gradient_clip = clip;
        self
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_min_word_freq(mut self, min_word_freq: usize) -> Self {
        self.min_word_freq = min_word_freq;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.epochs == 0 {
            bail!("epochs must be positive");
        }
        if self.batch_size == 0 {
            bail!("batch size must be positive");
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        if self.weight_decay < 0.0 || self.gradient_clip < 0.0 {
            bail!("weight decay and gradient clip must be non-negative");
        }
        if self.min_word_freq == 0 {
            bail!("minimum word frequency must be at least 1");
        }
        Ok(())
    }
}

/// Losses for one epoch, averaged per sentence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f32,
    pub valid_loss: f32,
    pub valid_f1: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainSummary {
    pub best_epoch: usize,
    pub best_valid_loss: f32,
    pub stopped_early: bool,
    pub history: Vec<EpochStats>,
}

/// Tracks the best validation loss and counts epochs since it last improved.
#[derive(Debug, Clone)]
struct EarlyStopping {
    patience: usize,
    best: f32,
    best_epoch: usize,
    stale: usize,
}

impl EarlyStopping {
    fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f32::INFINITY,
            best_epoch: 0,
            stale: 0,
        }
    }

    /// Record `loss`; true when it beats the best so far.
    fn observe(&mut self, epoch: usize, loss: f32) -> bool {
        if loss < self.best {
            self.best = loss;
            self.best_epoch = epoch;
            self.stale = 0;
            true
        } else {
            self.stale += 1;
            false
        }
    }

    fn should_stop(&self) -> bool {
        self.stale >= self.patience
    }
}

pub struct Trainer {
    config: TrainConfig,
    tagger: SequenceTagger,
    vars: Vec<Var>,
    optimizer: AdamW,
    rng: oorandom::Rand64,
}

impl Trainer {
    /// Wrap `tagger` for training. Install any pretrained word table first:
    /// the optimizer's variable list is fixed here.
    pub fn new(tagger: SequenceTagger, config: TrainConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let vars = tagger.trainable_vars();
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(vars.clone(), params)?;
        let rng = oorandom::Rand64::new(config.seed as u128);
        info!(
            parameters = vars.iter().map(|v| v.elem_count()).sum::<usize>(),
            lr = config.learning_rate,
            batch_size = config.batch_size,
            "initialised trainer"
        );
        Ok(Self {
            config,
            tagger,
            vars,
            optimizer,
            rng,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn tagger(&self) -> &SequenceTagger {
        &self.tagger
    }

    pub fn into_tagger(self) -> SequenceTagger {
        self.tagger
    }

    /// One shuffled pass over `examples`; returns the mean loss per sentence.
    pub fn train_epoch(&mut self, examples: &[Example]) -> anyhow::Result<f32> {
        let mut order: Vec<usize> = (0..examples.len()).collect();
        for i in (1..order.len()).rev() {
            let j = self.rng.rand_range(0..(i as u64 + 1)) as usize;
            order.swap(i, j);
        }

        let mut total = 0.0f32;
        for (step, indices) in order.chunks(self.config.batch_size).enumerate() {
            let chunk: Vec<&Example> = indices.iter().map(|&i| &examples[i]).collect();
            let batch = self.tagger.encode_tagged(
                &token_lists(chunk.iter().copied()),
                &tag_lists(chunk.iter().copied()),
            )?;

            let loss = self.tagger.loss(&batch, true)?;
            let loss = if loss.rank() > 0 { loss.sum_all()? } else { loss };
            let value = loss.to_scalar::<f32>()?;
            if !value.is_finite() {
                bail!("loss diverged at step {step}: {value}");
            }

            let mut grads = loss.backward()?;
            let norm = clip_gradients(&mut grads, &self.vars, self.config.gradient_clip)?;
            self.optimizer.step(&grads)?;

            let batch_total = match self.tagger.config().reduction {
                Reduction::Mean => value * chunk.len() as f32,
                _ => value,
            };
            total += batch_total;
            debug!(step, loss = value, grad_norm = norm, "train step");
        }
        Ok(total / examples.len().max(1) as f32)
    }

    /// Mean negative log-likelihood per sentence, without dropout.
    pub fn validation_loss(&self, examples: &[Example]) -> anyhow::Result<f32> {
        let mut total = 0.0f32;
        for chunk in examples.chunks(self.config.batch_size) {
            let batch = self
                .tagger
                .encode_tagged(&token_lists(chunk), &tag_lists(chunk))?;
            let llh = self.tagger.log_likelihood(&batch, false)?;
            total -= llh.sum_all()?.to_scalar::<f32>()?;
        }
        Ok(total / examples.len().max(1) as f32)
    }

    /// Train until `epochs` or until validation loss stops improving.
    ///
    /// The best weights are restored before returning and, when
    /// `checkpoint_dir` is given, saved there each time they improve. With
    /// no validation data the training loss drives early stopping.
    pub fn fit(
        &mut self,
        train: &[Example],
        valid: &[Example],
        checkpoint_dir: Option<&Path>,
    ) -> anyhow::Result<TrainSummary> {
        let train: Vec<Example> = train.iter().filter(|e| !e.is_empty()).cloned().collect();
        let valid: Vec<Example> = valid.iter().filter(|e| !e.is_empty()).cloned().collect();
        if train.is_empty() {
            bail!("no non-empty training sentences");
        }
        if valid.is_empty() {
            warn!("no validation data; early stopping follows the training loss");
        }
        info!(
            train = train.len(),
            valid = valid.len(),
            epochs = self.config.epochs,
            "starting training"
        );

        let mut stopping = EarlyStopping::new(self.config.patience);
        let mut best = self.snapshot()?;
        let mut history = Vec::new();
        let mut stopped_early = false;

        for epoch in 1..=self.config.epochs {
            let train_loss = self.train_epoch(&train)?;
            let (valid_loss, valid_f1) = if valid.is_empty() {
                (train_loss, None)
            } else {
                let metrics = evaluate(&self.tagger, &valid, self.config.batch_size)?;
                (self.validation_loss(&valid)?, Some(metrics.f1()))
            };
            info!(
                epoch,
                train_loss,
                valid_loss,
                valid_f1 = valid_f1.unwrap_or(f64::NAN),
                "finished epoch"
            );
            history.push(EpochStats {
                epoch,
                train_loss,
                valid_loss,
                valid_f1,
            });

            if stopping.observe(epoch, valid_loss) {
                best = self.snapshot()?;
                if let Some(dir) = checkpoint_dir {
                    checkpoint::save(&self.tagger, dir)
                        .with_context(|| format!("saving checkpoint to {}", dir.display()))?;
                }
            } else if stopping.should_stop() {
                info!(epoch, best_epoch = stopping.best_epoch, "early stopping");
                stopped_early = true;
                break;
            }
        }

        restore(&best)?;
        Ok(TrainSummary {
            best_epoch: stopping.best_epoch,
            best_valid_loss: stopping.best,
            stopped_early,
            history,
        })
    }

    fn snapshot(&self) -> anyhow::Result<Vec<(Var, Tensor)>> {
        self.vars
            .iter()
            .map(|var| Ok((var.clone(), var.as_tensor().copy()?)))
            .collect()
    }
}

fn restore(snapshot: &[(Var, Tensor)]) -> anyhow::Result<()> {
    for (var, value) in snapshot {
        var.set(value)?;
    }
    Ok(())
}

/// Scale gradients so their joint L2 norm is at most `max_norm`; returns
/// the norm before scaling.
fn clip_gradients(grads: &mut GradStore, vars: &[Var], max_norm: f32) -> anyhow::Result<f32> {
    let mut sum_sq = 0.0f32;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_sq += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let norm = sum_sq.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = f64::from(max_norm / norm);
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), grad.affine(scale, 0.0)?);
            }
        }
    }
    Ok(norm)
}
