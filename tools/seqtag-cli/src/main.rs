//! `seqtag`: train, evaluate and run BiLSTM-CRF taggers from the shell.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use candle_core::Device;
use clap::{Parser, Subcommand};
use seqtag_core::{ContextualProvider, DistilBertProvider, SequenceTagger, TaggerConfig, checkpoint};
use seqtag_trainer::{TrainConfig, Trainer, build_vocabulary, evaluate, load_conll, load_pretrained};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "seqtag")]
#[command(about = "Named-entity tagging with a BiLSTM-CRF")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a tagger on CoNLL data and save the best checkpoint
    Train(TrainArgs),
    /// Score a checkpoint against tagged CoNLL data
    Evaluate {
        /// Checkpoint directory
        #[arg(short, long)]
        model: PathBuf,
        /// CoNLL file with gold tags
        #[arg(short, long)]
        data: PathBuf,
        /// DistilBERT directory, for models trained with contextual features
        #[arg(long)]
        contextual: Option<PathBuf>,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
        /// Print metrics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Tag whitespace-tokenised sentences, one per line, from a file or stdin
    Predict {
        /// Checkpoint directory
        #[arg(short, long)]
        model: PathBuf,
        /// Input file; stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// DistilBERT directory, for models trained with contextual features
        #[arg(long)]
        contextual: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct TrainArgs {
    /// Training CoNLL file
    #[arg(long)]
    train: PathBuf,
    /// Validation CoNLL file
    #[arg(long)]
    valid: Option<PathBuf>,
    /// Checkpoint output directory
    #[arg(short, long)]
    output: PathBuf,
    /// JSON file with `tagger` and `train` sections; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Pretrained word vectors in GloVe text format
    #[arg(long)]
    pretrained: Option<PathBuf>,
    /// Update pretrained word vectors during training
    #[arg(long)]
    fine_tune_words: bool,
    /// DistilBERT directory (tokenizer.json, config.json, model.safetensors)
    #[arg(long)]
    contextual: Option<PathBuf>,
    #[arg(long)]
    no_word: bool,
    #[arg(long)]
    no_char: bool,
    /// Train with per-token cross-entropy instead of the CRF
    #[arg(long)]
    no_crf: bool,
    /// Attention pooling over characters instead of max pooling
    #[arg(long)]
    attention: bool,
    /// Pin BIO-illegal transitions
    #[arg(long)]
    constrain: bool,
    #[arg(long)]
    hidden: Option<usize>,
    #[arg(long)]
    layers: Option<usize>,
    #[arg(long)]
    dropout: Option<f32>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    patience: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    tagger: TaggerConfig,
    train: TrainConfig,
}

impl TrainArgs {
    fn resolve(&self) -> Result<RunConfig> {
        let mut run = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => RunConfig::default(),
        };

        let mut tagger = run.tagger;
        if self.no_word {
            tagger = tagger.with_word(false);
        }
        if self.no_char {
            tagger = tagger.with_char(false);
        }
        if self.no_crf {
            tagger = tagger.with_crf(false);
        }
        if self.attention {
            tagger = tagger.with_attention_pooling(true);
        }
        if self.constrain {
            tagger = tagger.with_constrained_transitions(true);
        }
        if self.hidden.is_some() || self.layers.is_some() {
            let hidden = self.hidden.unwrap_or(tagger.hidden_dim);
            let layers = self.layers.unwrap_or(tagger.num_layers);
            tagger = tagger.with_hidden(hidden, layers);
        }
        if let Some(p) = self.dropout {
            tagger = tagger.with_dropout(p);
        }
        // freezing only applies to a pretrained table
        tagger = tagger.with_frozen_words(self.pretrained.is_some() && !self.fine_tune_words);
        run.tagger = tagger;

        let mut train = run.train;
        if let Some(epochs) = self.epochs {
            train = train.with_epochs(epochs);
        }
        if let Some(batch_size) = self.batch_size {
            train = train.with_batch_size(batch_size);
        }
        if let Some(lr) = self.lr {
            train = train.with_learning_rate(lr);
        }
        if let Some(patience) = self.patience {
            train = train.with_patience(patience);
        }
        if let Some(seed) = self.seed {
            train = train.with_seed(seed);
        }
        train.validate()?;
        run.train = train;
        Ok(run)
    }
}

#[derive(Serialize)]
struct TaggedSentence<'a> {
    tokens: &'a [&'a str],
    tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn load_contextual(dir: Option<&Path>, device: &Device) -> Result<Option<Box<dyn ContextualProvider>>> {
    dir.map(|dir| {
        let provider = DistilBertProvider::load(dir, device)
            .with_context(|| format!("loading contextual model from {}", dir.display()))?;
        Ok(Box::new(provider) as Box<dyn ContextualProvider>)
    })
    .transpose()
}

fn load_model(model: &Path, contextual: Option<&Path>, device: &Device) -> Result<SequenceTagger> {
    let (config, _) = checkpoint::read_metadata(model)
        .with_context(|| format!("reading checkpoint {}", model.display()))?;
    if config.tagger.use_contextual && contextual.is_none() {
        bail!("{} was trained with contextual features; pass --contextual", model.display());
    }
    let provider = load_contextual(contextual.filter(|_| config.tagger.use_contextual), device)?;
    Ok(checkpoint::load(model, provider, device)?)
}

fn train(args: TrainArgs, device: &Device) -> Result<()> {
    let RunConfig {
        tagger: mut tagger_config,
        train: train_config,
    } = args.resolve()?;

    let train_set = load_conll(&args.train)?;
    let valid_set = match &args.valid {
        Some(path) => load_conll(path)?,
        None => Vec::new(),
    };
    let vocab = build_vocabulary(&train_set, train_config.min_word_freq)?;

    let table = match &args.pretrained {
        Some(path) if tagger_config.use_word => {
            let table = load_pretrained(path, &vocab.words, train_config.seed)?;
            tagger_config = tagger_config.with_word_dim(table.dim(1)?);
            Some(table)
        }
        _ => None,
    };
    let contextual = load_contextual(args.contextual.as_deref(), device)?;
    if let Some(provider) = &contextual {
        tagger_config = tagger_config.with_contextual(provider.dim());
    }

    let mut tagger = SequenceTagger::new(tagger_config, Arc::new(vocab), contextual, device)?;
    if let Some(table) = table {
        tagger.load_word_table(&table)?;
    }

    let mut trainer = Trainer::new(tagger, train_config)?;
    let summary = trainer.fit(&train_set, &valid_set, Some(&args.output))?;
    info!(
        best_epoch = summary.best_epoch,
        best_valid_loss = summary.best_valid_loss,
        stopped_early = summary.stopped_early,
        output = %args.output.display(),
        "training complete"
    );

    if !valid_set.is_empty() {
        let metrics = evaluate(trainer.tagger(), &valid_set, trainer.config().batch_size)?;
        print!("{metrics}");
    }
    std::fs::write(
        args.output.join("history.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;
    Ok(())
}

/// Tag each input line; a line the model rejects is reported and skipped.
/// Returns the number of rejected lines.
fn predict<R: BufRead, W: Write>(tagger: &SequenceTagger, input: R, out: &mut W) -> Result<usize> {
    let mut rejected = 0;
    for (line_no, line) in input.lines().enumerate() {
        let line = line?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (tags, error) = match tagger.predict(std::slice::from_ref(&tokens)) {
            Ok(mut tags) => (tags.pop().unwrap_or_default(), None),
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping sentence");
                rejected += 1;
                (Vec::new(), Some(e.to_string()))
            }
        };
        let json = serde_json::to_string(&TaggedSentence {
            tokens: &tokens,
            tags: &tags,
            error,
        })?;
        writeln!(out, "{json}")?;
    }
    Ok(rejected)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let device = Device::Cpu;

    match cli.command {
        Commands::Train(args) => train(args, &device)?,
        Commands::Evaluate {
            model,
            data,
            contextual,
            batch_size,
            json,
        } => {
            let tagger = load_model(&model, contextual.as_deref(), &device)?;
            let examples = load_conll(&data)?;
            let metrics = evaluate(&tagger, &examples, batch_size)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                print!("{metrics}");
            }
        }
        Commands::Predict {
            model,
            input,
            contextual,
        } => {
            let tagger = load_model(&model, contextual.as_deref(), &device)?;
            let reader: Box<dyn BufRead> = match input {
                Some(path) => Box::new(BufReader::new(
                    File::open(&path).with_context(|| format!("opening {}", path.display()))?,
                )),
                None => Box::new(BufReader::new(io::stdin())),
            };
            let rejected = predict(&tagger, reader, &mut io::stdout().lock())?;
            if rejected > 0 {
                warn!(rejected, "some sentences could not be tagged");
            }
        }
    }

    Ok(())
}
